use crate::modbus::{self, ModbusRTUCodec};
use futures::{SinkExt, StreamExt as _};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio_serial::{SerialPort as _, SerialPortBuilderExt as _, SerialStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open {1:?} for reading and writing")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("no valid response for the read of {count} register(s) at {address:#06x} in {attempts} attempts")]
    NoResponse { address: u16, count: u8, attempts: u32 },
    #[error("device reported modbus exception {code:#04x} reading {count} register(s) at {address:#06x}")]
    Exception { address: u16, count: u8, code: u8 },
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Option<modbus::Response>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, transaction_id: u16, response: modbus::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub async fn wait_for(&self, transaction_id: u16) -> Option<modbus::Response> {
        loop {
            // Interest must be registered before the map is checked, or a
            // notification arriving in between would be lost.
            let mut notified = pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device the controller is attached to.
    #[arg(long, short = 'd')]
    device: PathBuf,

    /// The modbus device ID of the controller.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// The baudrate of the serial line.
    ///
    /// Rover Li controllers talk at 9600-8N1 and this rarely needs changing.
    #[arg(long, default_value = "9600")]
    baudrate: u32,

    /// The amount of time to wait after writing out a request before expecting
    /// the response bytes.
    ///
    /// The controller needs a moment to turn the half-duplex line around.
    #[arg(long, default_value = "100ms")]
    settle_delay: humantime::Duration,

    /// If a complete response isn't received in this amount of time past the settle
    /// delay, consider the request failed.
    ///
    /// Most reads will at that point attempt to retry the request.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Attempt each read at most this many times before giving up.
    #[arg(long, default_value = "5")]
    retries: u32,

    /// The amount of time to wait before retrying a failed read.
    #[arg(long, default_value = "100ms")]
    retry_delay: humantime::Duration,

    /// Reopen the serial device after the specified number of reads time out in a row.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,
}

pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    worker: tokio::task::JoinHandle<Result<(), Error>>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: std::sync::atomic::AtomicU16,
    args: Args,
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker: Arc<ResponseTracker> = Default::default();
        let worker = RtuWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args: args.clone(),
            responses: Arc::clone(&response_tracker),
        }
        .spawn(jobs);
        Ok(Self {
            request_queue,
            worker,
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            args,
        })
    }

    pub fn device_id(&self) -> u8 {
        self.args.device_id
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Schedules a single request and waits for its outcome.
    ///
    /// `Ok(None)` means the request went out but no valid response came back
    /// (timeout, CRC failure or another discarded frame.)
    pub async fn send(
        &self,
        operation: modbus::Operation,
    ) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request =
            modbus::Request { device_id: self.args.device_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(self.response_tracker.wait_for(transaction_id).await)
    }

    /// [`Self::send`] for a holding register read, but with retries.
    ///
    /// Timeouts, discarded frames and modbus exceptions all consume one attempt
    /// from the same budget. Registers come back in address order.
    pub async fn read_holdings(&self, address: u16, count: u8) -> Result<Vec<u16>, Error> {
        debug_assert!(count > 0 && count <= modbus::MAX_READ_COUNT);
        let operation = modbus::Operation::ReadHoldings { address, count };
        let mut last_exception = None;
        for attempt in 1..=self.args.retries {
            if attempt > 1 {
                tokio::time::sleep(*self.args.retry_delay).await;
            }
            match self.send(operation).await? {
                None => {
                    debug!(message = "read attempt got no valid response", address, attempt);
                }
                Some(response) => match response.kind {
                    modbus::ResponseKind::Exception(code) => {
                        debug!(
                            message = "read attempt returned an exception",
                            address, attempt, code
                        );
                        last_exception = Some(code);
                    }
                    modbus::ResponseKind::Holdings { registers } => return Ok(registers),
                },
            }
        }
        Err(match last_exception {
            Some(code) => Error::Exception { address, count, code },
            None => Error::NoResponse { address, count, attempts: self.args.retries },
        })
    }

    /// Winds the connection down and reports the worker's terminal error, if any.
    ///
    /// A worker that died early (say, because the device could not be opened)
    /// otherwise only surfaces as scheduling failures on subsequent reads.
    pub async fn finish(self) -> Result<(), Error> {
        drop(self.request_queue);
        match self.worker.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(join_error) => {
                warn!(
                    message = "connection worker went away",
                    error = (&join_error as &dyn std::error::Error)
                );
                Ok(())
            }
        }
    }
}

struct RtuWorker {
    args: Args,
    responses: Arc<ResponseTracker>,
    reconnect_countdown: usize,
}

type RtuIo = Framed<SerialStream, ModbusRTUCodec>;

enum ServeOutcome {
    Shutdown(Result<(), std::io::Error>),
    Reconnect,
}

#[derive(thiserror::Error, Debug)]
enum ExchangeError {
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the serial stream was closed")]
    Closed,
    #[error("no complete response arrived in time")]
    Timeout,
    #[error("received a frame that did not validate")]
    Frame(#[source] modbus::FrameError),
    #[error("response claims to be from device {received}, expected {expected}")]
    DeviceIdMismatch { expected: u8, received: u8 },
    #[error("response carries {received} register(s), expected {expected}")]
    RegisterCountMismatch { expected: u8, received: usize },
}

impl RtuWorker {
    fn spawn(
        self,
        jobs: UnboundedReceiver<modbus::Request>,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::task::spawn(self.main_loop(jobs))
    }

    async fn main_loop(
        mut self,
        mut jobs: UnboundedReceiver<modbus::Request>,
    ) -> Result<(), Error> {
        let result = loop {
            let mut io = match self.connect().await {
                Ok(io) => io,
                Err(e) => break Err(e),
            };
            match self.serve(&mut io, &mut jobs).await {
                ServeOutcome::Shutdown(Ok(())) => break Ok(()),
                ServeOutcome::Shutdown(Err(e)) => break Err(Error::Shutdown(e)),
                ServeOutcome::Reconnect => {}
            }
        };
        // Leftover requests would otherwise leave their callers waiting forever.
        jobs.close();
        while let Ok(request) = jobs.try_recv() {
            self.responses.mark_timeout(request.transaction_id);
        }
        result
    }

    async fn serve(
        &mut self,
        io: &mut RtuIo,
        jobs: &mut UnboundedReceiver<modbus::Request>,
    ) -> ServeOutcome {
        loop {
            let Some(request) = jobs.recv().await else {
                return ServeOutcome::Shutdown(io.close().await);
            };
            // The line is idle between exchanges. Anything already buffered is
            // noise or a stale response and would desynchronize this exchange.
            let discard_result = io.get_ref().clear(tokio_serial::ClearBuffer::Input);
            trace!(message = "discarding stale input", is_error = ?discard_result.err());
            let exchange_result = exchange(
                io,
                &request,
                *self.args.settle_delay,
                *self.args.read_timeout,
            )
            .await;
            match exchange_result {
                Ok(response) => {
                    self.reconnect_countdown = self.args.reconnect_after_timeouts;
                    self.responses.add_response(request.transaction_id, response);
                }
                Err(error) => {
                    self.responses.mark_timeout(request.transaction_id);
                    match error {
                        ExchangeError::Send(_)
                        | ExchangeError::Receive(_)
                        | ExchangeError::Closed => {
                            warn!(
                                message = "serial stream failed, will reopen",
                                error = (&error as &dyn std::error::Error)
                            );
                            return ServeOutcome::Reconnect;
                        }
                        ExchangeError::Timeout => {
                            debug!(
                                message = "request timed out",
                                transaction_id = request.transaction_id,
                                reconnect_countdown = self.reconnect_countdown
                            );
                            let Some(new_count) = self.reconnect_countdown.checked_sub(1) else {
                                warn!("too many timeouts in a row, will reopen the serial device");
                                return ServeOutcome::Reconnect;
                            };
                            self.reconnect_countdown = new_count;
                        }
                        ExchangeError::Frame(_)
                        | ExchangeError::DeviceIdMismatch { .. }
                        | ExchangeError::RegisterCountMismatch { .. } => {
                            warn!(
                                message = "discarding an invalid response",
                                error = (&error as &dyn std::error::Error)
                            );
                        }
                    }
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<RtuIo, Error> {
        let path = &self.args.device;
        info!(message = "opening the serial device...", device = ?path);
        let stream = tokio_serial::new(path.to_string_lossy(), self.args.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, path.clone()))?;
        info!(message = "serial device open");
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(stream, ModbusRTUCodec {}))
    }
}

/// Runs one request-response exchange over the framed stream.
///
/// RTU responses carry no transaction identifier; correlation is purely by
/// order, which holds because the worker never has more than one request on
/// the line.
async fn exchange<S>(
    io: &mut Framed<S, ModbusRTUCodec>,
    request: &modbus::Request,
    settle_delay: Duration,
    read_timeout: Duration,
) -> Result<modbus::Response, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.read_buffer_mut().clear();
    io.send(request).await.map_err(ExchangeError::Send)?;
    tokio::time::sleep(settle_delay).await;
    let frame = match tokio::time::timeout(read_timeout, io.next()).await {
        Err(_elapsed) => return Err(ExchangeError::Timeout),
        Ok(None) => return Err(ExchangeError::Closed),
        Ok(Some(Err(e))) => return Err(ExchangeError::Receive(e)),
        Ok(Some(Ok(frame))) => frame,
    };
    let response = frame.map_err(ExchangeError::Frame)?;
    if response.device_id != request.device_id {
        return Err(ExchangeError::DeviceIdMismatch {
            expected: request.device_id,
            received: response.device_id,
        });
    }
    let modbus::Operation::ReadHoldings { count, .. } = request.operation;
    if let modbus::ResponseKind::Holdings { registers } = &response.kind {
        if registers.len() != usize::from(count) {
            return Err(ExchangeError::RegisterCountMismatch {
                expected: count,
                received: registers.len(),
            });
        }
    }
    Ok(response)
}
