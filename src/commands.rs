pub mod registers {
    use crate::output;
    use crate::registers::{Encoding, FIELDS, Persistence};

    /// Search and output the known fields of the controller's register map.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only show fields whose name, description or address contains this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldSchema {
        pub address: u16,
        pub words: u8,
        pub name: &'static str,
        pub rule: Encoding,
        pub persistence: Persistence,
        pub description: &'static str,
    }

    impl FieldSchema {
        pub fn all_fields() -> impl Iterator<Item = Self> {
            FIELDS.iter().map(|&field| FieldSchema {
                address: field.address(),
                words: field.word_count(),
                name: field.name(),
                rule: field.encoding(),
                persistence: field.persistence(),
                description: field.description(),
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            if self.name.contains(&pattern) {
                return true;
            }
            if self.description.to_lowercase().contains(&pattern) {
                return true;
            }
            if format!("{:#06x}", self.address).contains(&pattern) {
                return true;
            }
            self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Address", "Words", "Name", "Rule", "Persistence", "Description"])
            .map_err(Error::Output)?;
        for field in FieldSchema::all_fields() {
            if let Some(pattern) = &args.filter {
                if !field.is_match(pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![
                            format!("{:#06x}", field.address),
                            field.words.to_string(),
                            field.name.to_string(),
                            field.rule.to_string(),
                            field.persistence.to_string(),
                            field.description.to_string(),
                        ]
                    },
                    || &field,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn filter_matches_names_addresses_and_descriptions() {
            let schema = FieldSchema::all_fields()
                .find(|schema| schema.name == "battery_type")
                .unwrap();
            assert!(schema.is_match("battery"));
            assert!(schema.is_match("BATTERY"));
            assert!(schema.is_match("0xe004"));
            assert!(schema.is_match(&0xE004u16.to_string()));
            assert!(schema.is_match("configured"));
            assert!(!schema.is_match("solar"));
        }
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::output;
    use crate::registers::{Field, Value};
    use crate::rover::{self, RoverDevice, View};

    /// Read named fields or a predefined view from the controller once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Read a predefined group of fields instead of naming them.
        #[arg(long, value_enum, conflicts_with = "fields")]
        view: Option<View>,
        /// Field names to read (the `registers` subcommand lists them all.)
        #[arg(required_unless_present = "view")]
        fields: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("field {0:?} is not known (the `registers` subcommand lists them all)")]
        UnknownField(String),
        #[error("could not set up the modbus connection")]
        Connect(#[source] connection::Error),
        #[error("could not read the requested fields")]
        Read(#[source] rover::Error),
        #[error("the connection did not shut down cleanly")]
        Finish(#[source] connection::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        field: &'a str,
        value: &'a Value,
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let fields = args
            .fields
            .iter()
            .map(|name| Field::from_name(name).ok_or_else(|| Error::UnknownField(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let device_id = connection.device_id();
        let device = RoverDevice::new(connection, device_id);
        device.prime_static_cache().await;
        output.table_headers(vec!["Field", "Value"]).map_err(Error::Output)?;
        match args.view {
            Some(view) => {
                let values = device.view(view).await;
                for (&name, value) in &values {
                    output
                        .result(
                            || vec![name.to_string(), value.to_string()],
                            || Record { field: name, value },
                        )
                        .map_err(Error::Output)?;
                }
            }
            None => {
                for field in fields {
                    let value = device.read_field(field).await.map_err(Error::Read)?;
                    output
                        .result(
                            || vec![field.name().to_string(), value.to_string()],
                            || Record { field: field.name(), value: &value },
                        )
                        .map_err(Error::Output)?;
                }
            }
        }
        device.into_connection().finish().await.map_err(Error::Finish)?;
        output.commit().map_err(Error::Output)
    }
}

pub mod monitor {
    use futures::StreamExt as _;

    use crate::connection::{self, Connection};
    use crate::output;
    use crate::registers::Value;
    use crate::rover::{self, RoverDevice, View};

    /// Periodically sample a group of fields from the controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// The group of fields to sample.
        #[arg(long, value_enum, default_value_t = View::All)]
        view: View,
        /// Time between the starts of consecutive samples.
        #[arg(long, default_value = "60s")]
        interval: humantime::Duration,
        /// Stop after this many samples instead of running forever.
        #[arg(long)]
        count: Option<u64>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the modbus connection")]
        Connect(#[source] connection::Error),
        #[error("the connection did not shut down cleanly")]
        Finish(#[source] connection::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        time: &'a str,
        field: &'a str,
        value: &'a Value,
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let device_id = connection.device_id();
        let device = RoverDevice::new(connection, device_id);
        device.prime_static_cache().await;
        output.table_headers(vec!["Time", "Field", "Value"]).map_err(Error::Output)?;
        let mut samples = 0;
        {
            let stream = rover::cycles(&device, args.interval.into(), args.view);
            let mut stream = std::pin::pin!(stream);
            while args.count.is_none_or(|count| samples < count) {
                let Some(values) = stream.next().await else { break };
                let time = jiff::Timestamp::now().to_string();
                for (&name, value) in &values {
                    output
                        .result(
                            || vec![time.clone(), name.to_string(), value.to_string()],
                            || Record { time: &time, field: name, value },
                        )
                        .map_err(Error::Output)?;
                }
                output.checkpoint().map_err(Error::Output)?;
                samples += 1;
            }
        }
        device.into_connection().finish().await.map_err(Error::Finish)?;
        output.commit().map_err(Error::Output)
    }
}
