//! Data logging toolkit.

use crate::{common::*, utils::RateCounter};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Derivative)]
    #[derivative(Debug)]
    pub struct LoggingWorker {
        #[derivative(Debug = "ignore")]
        event_writer: EventWriter<BufWriter<File>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            logging_dir: Arc<Path>,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            // prepare dirs
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("faster-rcnn")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("invalid event path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;
            let rate_counter = RateCounter::with_second_interval();

            Ok(Self {
                event_writer,
                rate_counter,
                rx,
            })
        }

        /// Start the data logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let msg = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(num_skipped)) => {
                        warn!("logging worker lagged behind by {} messages", num_skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                self.log_training_step(msg).await?;

                if let Some(rate) = self.rate_counter.rate() {
                    info!("logged {:.2} events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_training_step(&mut self, msg: LoggingMessage) -> Result<()> {
            let LoggingMessage {
                tag,
                step,
                lr,
                losses,
            } = msg;
            let step = step as i64;

            // log parameters
            self.event_writer
                .write_scalar_async(format!("{}/params/learning_rate", tag), step, lr as f32)
                .await?;

            // log losses
            for (name, value) in losses {
                self.event_writer
                    .write_scalar_async(format!("{}/loss/{}", tag, name), step, value as f32)
                    .await?;
            }

            Ok(())
        }
    }

    /// Start the data logging worker. The worker stops when all senders are dropped.
    pub async fn logging_worker(
        logging_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(logging_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub step: usize,
        pub lr: f64,
        pub losses: IndexMap<&'static str, f64>,
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(
            tag: S,
            step: usize,
            lr: f64,
            losses: IndexMap<&'static str, f64>,
        ) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                step,
                lr,
                losses,
            }
        }
    }
}
