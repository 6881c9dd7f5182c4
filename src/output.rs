use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the results to this file instead of the standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = self.format.formatter();
        Ok(Output { args: self, io, formatter })
    }
}

impl Format {
    fn formatter(&self) -> Formatter {
        match self {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy, headers: Vec::new(), row_count: 0 }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        }
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table, headers: Vec<&'static str>, row_count: usize },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    panic!("table headers for csv must be written very first!");
                }
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy, headers, .. } => {
                comfy.set_header(hdrs.clone());
                *headers = hdrs;
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    panic!("something wrong with csv output");
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let inp = value.as_bytes();
            let (WriteResult::InputEmpty, ib, ob) = writer.field(inp, &mut output) else {
                panic!("something wrong with csv output");
            };
            assert_eq!(value.len(), ib);
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            panic!("something wrong with csv output");
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, row_count, .. } => {
                comfy.add_row(table_row());
                *row_count += 1;
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    /// Makes everything produced so far visible to the consumer.
    ///
    /// Line oriented formats are flushed; an accumulated table is printed and
    /// a new one started, so that an unbounded caller still produces output.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        let table = match &mut self.formatter {
            Formatter::Table { comfy, headers, row_count } if *row_count > 0 => {
                let mut fresh = comfy_table::Table::new();
                fresh.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                if !headers.is_empty() {
                    fresh.set_header(headers.clone());
                }
                *row_count = 0;
                Some(std::mem::replace(comfy, fresh))
            }
            _ => None,
        };
        if let Some(table) = table {
            self.io
                .write_fmt(format_args!("{table}\n"))
                .map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Csv { written_records: _ } => {}
            Formatter::Table { comfy, row_count, .. } => {
                if *row_count > 0 {
                    self.io
                        .write_fmt(format_args!("{}", comfy))
                        .map_err(|e| self.write_error(e))?;
                }
            }
            Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn output_to(buffer: &SharedBuffer, format: Format) -> Output {
        Output {
            formatter: format.formatter(),
            args: Args { output: None, format },
            io: Box::new(buffer.clone()),
        }
    }

    #[derive(serde::Serialize)]
    struct Record {
        field: &'static str,
        value: f64,
    }

    #[test]
    fn csv_rows_are_delimited_and_quoted() {
        let buffer = SharedBuffer::default();
        let mut output = output_to(&buffer, Format::Csv);
        output.table_headers(vec!["field", "value"]).unwrap();
        output
            .result(
                || vec!["battery_voltage".to_string(), "12.3".to_string()],
                || Record { field: "battery_voltage", value: 12.3 },
            )
            .unwrap();
        output
            .result(
                || vec!["with,comma".to_string(), "0.5".to_string()],
                || Record { field: "with,comma", value: 0.5 },
            )
            .unwrap();
        output.commit().unwrap();
        assert_eq!(
            buffer.contents(),
            "field,value\nbattery_voltage,12.3\n\"with,comma\",0.5\n"
        );
    }

    #[test]
    fn jsonl_produces_one_record_per_line() {
        let buffer = SharedBuffer::default();
        let mut output = output_to(&buffer, Format::Jsonl);
        output.table_headers(vec!["field", "value"]).unwrap();
        output
            .result(
                || vec!["battery_voltage".to_string(), "12.3".to_string()],
                || Record { field: "battery_voltage", value: 12.3 },
            )
            .unwrap();
        output.commit().unwrap();
        assert_eq!(buffer.contents(), "{\"field\":\"battery_voltage\",\"value\":12.3}\n");
    }

    #[test]
    fn checkpoint_prints_the_accumulated_table() {
        let buffer = SharedBuffer::default();
        let mut output = output_to(&buffer, Format::Table);
        output.table_headers(vec!["field", "value"]).unwrap();
        output
            .result(
                || vec!["solar_power".to_string(), "70".to_string()],
                || Record { field: "solar_power", value: 70.0 },
            )
            .unwrap();
        output.checkpoint().unwrap();
        let first = buffer.contents();
        assert!(first.contains("solar_power"));

        // A checkpoint with no new rows prints nothing further.
        output.checkpoint().unwrap();
        assert_eq!(buffer.contents(), first);

        output
            .result(
                || vec!["solar_power".to_string(), "75".to_string()],
                || Record { field: "solar_power", value: 75.0 },
            )
            .unwrap();
        output.commit().unwrap();
        assert!(buffer.contents().len() > first.len());
        assert!(buffer.contents().contains("75"));
    }
}
