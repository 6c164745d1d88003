use crate::consumers::builders::consumer_pool_configuration::ConsumerPoolConfiguration;
use crate::consumers::builders::destination_handler::DestinationHandler;
use crate::consumers::worker::{PollWorker, PushWorker, Worker, WorkerContext};
use crate::consumers::{
    ConsumeMode, ConsumerError, ConsumerPoolConfigurationBuilder, WorkerState, WorkerStatus,
};
use crate::message::Destination;
use crate::pool::ConnectionPool;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A set of workers consuming one or more destinations.
///
/// `ConsumerPool` is the main entrypoint if you want to receive and process messages.
/// Every destination gets `threads_per_destination` workers; each worker owns a dedicated
/// session, outside of the bounded producer pool, and processes one message at a time.
///
/// # How do I build a `ConsumerPool`?
///
/// The starting point is [`ConsumerPool::builder`].
/// Once you are done with pool-level configuration, you can start adding destinations using
/// [`ConsumerPoolConfigurationBuilder::destination_handler`].
///
/// # Lifecycle
///
/// Nothing is received until [`ConsumerPool::start`] is called. [`ConsumerPool::stop`] asks
/// every worker to finish the message in flight, closes their sessions and waits for them.
pub struct ConsumerPool {
    configuration: ConsumerPoolConfiguration,
    destination_handlers: Vec<DestinationHandler>,
    running: Mutex<Option<RunningWorkers>>,
}

struct RunningWorkers {
    shutdown: CancellationToken,
    workers: Vec<RunningWorker>,
}

struct RunningWorker {
    destination: String,
    index: usize,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl RunningWorkers {
    async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.task.await {
                tracing::error!(
                    destination = %worker.destination,
                    worker = worker.index,
                    error = ?e,
                    "Consumer worker crashed"
                );
            }
        }
    }
}

impl ConsumerPool {
    /// Start building a [`ConsumerPool`] on top of a connection pool.
    pub fn builder(connection_pool: ConnectionPool) -> ConsumerPoolConfigurationBuilder {
        ConsumerPoolConfigurationBuilder::new(connection_pool)
    }

    /// Spawn every worker.
    ///
    /// Pre-start hooks run first, once per destination. If any worker fails to start, the ones
    /// already running are stopped and the error is returned.
    #[tracing::instrument(skip_all, name = "consumer_pool_start")]
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ConsumerError::AlreadyStarted);
        }
        let mut workers = RunningWorkers {
            shutdown: self.configuration.connection_pool.shutdown_token().child_token(),
            workers: Vec::new(),
        };
        for handler in &self.destination_handlers {
            if let Err(e) = self.start_destination(handler, &mut workers).await {
                workers.stop().await;
                return Err(e);
            }
        }
        tracing::info!(workers = workers.workers.len(), "Consumer pool started");
        *running = Some(workers);
        Ok(())
    }

    async fn start_destination(
        &self,
        handler: &DestinationHandler,
        running: &mut RunningWorkers,
    ) -> Result<(), ConsumerError> {
        let configuration = &self.configuration;
        let destination = Destination::from(match &configuration.destination_prefix {
            Some(prefix) => format!("{prefix}_{}", handler.destination),
            None => handler.destination.clone(),
        });
        let ack_mode = handler.ack_mode.unwrap_or(configuration.ack_mode);
        let consume_mode = handler.consume_mode.unwrap_or(configuration.consume_mode);
        let threads = handler
            .threads
            .unwrap_or(configuration.threads_per_destination);
        let prefetch_count = handler
            .prefetch_count
            .unwrap_or(configuration.prefetch_count);
        // Use the destination's pre-start hooks, if provided. Rely on the pool-level ones otherwise.
        let pre_start_hooks = if handler.pre_start_hooks.is_empty() {
            &configuration.pre_start_hooks
        } else {
            &handler.pre_start_hooks
        };

        for index in 0..threads {
            let session = configuration.connection_pool.open_dedicated(ack_mode).await?;
            if index == 0 {
                for hook in pre_start_hooks {
                    if let Err(source) = hook.run(&*session, &destination).await {
                        session.close().await;
                        return Err(ConsumerError::PreStartHook {
                            destination: destination.to_string(),
                            source,
                        });
                    }
                }
            }
            let subscribed = async {
                session.set_prefetch_count(prefetch_count).await?;
                session
                    .create_consumer(&destination, handler.selector.clone())
                    .await
            };
            let consumer = match subscribed.await {
                Ok(consumer) => consumer,
                Err(source) => {
                    session.close().await;
                    return Err(ConsumerError::Subscribe {
                        destination: destination.to_string(),
                        source,
                    });
                }
            };

            let (state_sender, state) = watch::channel(WorkerState::Starting);
            let context = WorkerContext {
                session,
                handler: Arc::clone(&handler.handler),
                state: state_sender,
            };
            let worker: Box<dyn Worker> = match consume_mode {
                ConsumeMode::Poll => Box::new(PollWorker {
                    context,
                    consumer,
                    receive_timeout: configuration.receive_timeout,
                }),
                ConsumeMode::Push => Box::new(PushWorker { context, consumer }),
            };
            let span = tracing::info_span!(
                "consumer_worker",
                destination = %destination,
                worker = index,
                %ack_mode
            );
            let task = tokio::spawn(worker.run(running.shutdown.clone()).instrument(span));
            running.workers.push(RunningWorker {
                destination: destination.to_string(),
                index,
                state,
                task,
            });
        }
        Ok(())
    }

    /// Ask every worker to stop and wait for them.
    ///
    /// In-flight messages are settled first. Does nothing if the pool is not running.
    #[tracing::instrument(skip_all, name = "consumer_pool_stop")]
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.stop().await;
            tracing::info!("Consumer pool stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// The current state of every worker. Empty if the pool is not running.
    pub async fn worker_statuses(&self) -> Vec<WorkerStatus> {
        match &*self.running.lock().await {
            None => Vec::new(),
            Some(running) => running
                .workers
                .iter()
                .map(|worker| WorkerStatus {
                    destination: worker.destination.clone(),
                    index: worker.index,
                    state: *worker.state.borrow(),
                })
                .collect(),
        }
    }

    /// Start the pool, then stop it once the process receives SIGTERM or Ctrl-C.
    ///
    /// You usually want to invoke `run_until_sigterm` at the end of your `main` function.
    pub async fn run_until_sigterm(&self) -> Result<(), ConsumerError> {
        self.start().await?;
        let signal = termination_signal().await;
        tracing::info!("Termination signal received, stopping the consumer pool");
        self.stop().await;
        signal.map_err(ConsumerError::Signal)
    }
}

#[cfg(unix)]
async fn termination_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        outcome = tokio::signal::ctrl_c() => outcome,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}

/// A builder to register destination handlers once the pool-level configuration of a
/// [`ConsumerPool`] has been finalised.
///
/// Use [`ConsumerPool::builder`] as entrypoint.
pub struct ConsumerPoolBuilder {
    pub(super) pool_configuration: ConsumerPoolConfiguration,
    pub(super) destination_handlers: Vec<DestinationHandler>,
}

impl ConsumerPoolBuilder {
    /// Add another [`DestinationHandler`] to the [`ConsumerPool`].
    #[must_use]
    pub fn destination_handler(mut self, handler: DestinationHandler) -> Self {
        self.destination_handlers.push(handler);
        self
    }

    /// Build the pool. No worker runs until [`ConsumerPool::start`] is called.
    pub fn build(self) -> ConsumerPool {
        ConsumerPool {
            configuration: self.pool_configuration,
            destination_handlers: self.destination_handlers,
            running: Mutex::new(None),
        }
    }
}
