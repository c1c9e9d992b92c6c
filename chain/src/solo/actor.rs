use super::{
    ingress::{Mailbox, Message},
    metrics::Metrics,
    Config,
};
use crate::{
    aggregator::{self, Aggregator},
    producer::{self, Producer},
    store::{self, PendingEntry, Store},
    types::{Block, ShardId, ShardMessage},
    window::Window,
    Activity, Broadcaster, Height, Keystore, Ledger, Pool, Reporter,
};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use rand::Rng;
use std::{
    collections::VecDeque,
    time::{Duration, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

/// Single-threaded owner of block production and finalization for one shard.
pub struct Actor<
    E: Clock + Spawner + RuntimeMetrics + Rng,
    L: Ledger,
    P: Pool,
    K: Keystore,
    B: Broadcaster,
    R: Reporter,
> {
    context: E,
    mailbox: mpsc::Receiver<Message>,
    sender: Mailbox,
    shard: ShardId,
    interval: Duration,

    store: Store<L, mpsc::UnboundedSender<Activity>>,
    activities: mpsc::UnboundedReceiver<Activity>,
    producer: Producer<L, P, K>,
    aggregator: Aggregator<L, K, B>,
    undispatched: VecDeque<(Height, Vec<ShardMessage>)>,
    window: Window,
    reporter: R,

    ticker: Option<Handle<()>>,
    metrics: Metrics,
}

impl<
        E: Clock + Spawner + RuntimeMetrics + Rng,
        L: Ledger,
        P: Pool,
        K: Keystore,
        B: Broadcaster,
        R: Reporter,
    > Actor<E, L, P, K, B, R>
{
    pub fn new(context: E, cfg: Config<L, P, K, B, R>) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::channel(cfg.mailbox_size);
        let sender = Mailbox::new(sender);
        let (reporter, activities) = mpsc::unbounded();
        let store = Store::new(cfg.ledger.clone(), reporter, cfg.pending_capacity);
        let producer = Producer::new(producer::Config {
            ledger: cfg.ledger.clone(),
            pool: cfg.pool,
            keystore: cfg.keystore.clone(),
            shard: cfg.shard,
            namespace: cfg.namespace.clone(),
        });
        let aggregator = Aggregator::new(aggregator::Config {
            ledger: cfg.ledger,
            keystore: cfg.keystore,
            broadcaster: cfg.broadcaster,
            shard: cfg.shard,
            namespace: cfg.namespace,
        });
        let metrics = Metrics::init(&context);
        metrics.chained_height.set(store.chained() as i64);

        (
            Self {
                context,
                mailbox,
                sender: sender.clone(),
                shard: cfg.shard,
                interval: cfg.interval,
                store,
                activities,
                producer,
                aggregator,
                undispatched: VecDeque::new(),
                window: Window::new(cfg.window_capacity),
                reporter: cfg.reporter,
                ticker: None,
                metrics,
            },
            sender,
        )
    }

    /// Run the actor until its context is shut down (or the returned handle is aborted).
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        info!(shard = %self.shard, chained = self.store.chained(), "solo actor ready");
        while let Some(message) = self.mailbox.next().await {
            match message {
                Message::Start => self.start_ticker(),
                Message::Stop => self.stop_ticker(),
                Message::Tick => {
                    self.dispatch();
                    self.propose();
                }
                Message::Block { block, response } => {
                    let result = self.finalize(block);
                    let _ = response.send(result);
                }
                Message::GetBlock { height, response } => {
                    let _ = response.send(self.store.get_block(height));
                }
                Message::Reload { response } => {
                    self.store.reload_from_ledger();
                    self.metrics
                        .chained_height
                        .set(self.store.chained() as i64);
                    let _ = response.send(self.store.chained());
                }
                Message::Chained { response } => {
                    let _ = response.send(self.store.chained());
                }
            }
        }
        self.stop_ticker();
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_some() {
            debug!("block production already started");
            return;
        }
        let mut mailbox = self.sender.clone();
        let interval = self.interval;
        let ticker = self
            .context
            .with_label("ticker")
            .spawn(move |context| async move {
                loop {
                    context.sleep(interval).await;
                    if mailbox.tick().await.is_err() {
                        return;
                    }
                }
            });
        self.ticker = Some(ticker);
        info!(shard = %self.shard, ?interval, "started block production");
    }

    fn stop_ticker(&mut self) {
        let Some(ticker) = self.ticker.take() else {
            return;
        };
        ticker.abort();
        self.window.clean();
        info!(shard = %self.shard, "stopped block production");
    }

    fn propose(&mut self) {
        if self.ticker.is_none() {
            debug!("ignoring tick while stopped");
            return;
        }
        let now = self
            .context
            .current()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let nonce = self.context.gen();
        let block = match self
            .producer
            .produce(&self.store, &mut self.window, now, nonce)
        {
            Ok(block) => block,
            Err(err) => {
                self.metrics.produce_failures.inc();
                warn!(?err, chained = self.store.chained(), "failed to produce block");
                return;
            }
        };
        self.metrics.produced.inc();
        if let Err(err) = self.finalize(block) {
            error!(?err, "failed to finalize produced block");
        }
    }

    fn finalize(&mut self, block: Block) -> Result<(), store::Error> {
        let height = block.height();
        if height <= self.store.chained() {
            self.metrics.stale.inc();
        }
        let result = self.store.add_block(PendingEntry::new(block));
        self.drain_activities();
        self.metrics
            .chained_height
            .set(self.store.chained() as i64);
        if let Err(err) = &result {
            self.metrics.store_failures.inc();
            warn!(height, ?err, "failed to add block");
        }
        result
    }

    /// Fold, dispatch, and forward everything the store reported.
    fn drain_activities(&mut self) {
        while let Ok(Some(activity)) = self.activities.try_next() {
            if let Activity::Executed { block, result } = &activity {
                if self.ticker.is_some() && block.header.shard == self.shard {
                    self.window.add_block(block);
                }
                self.producer.accepted(block);
                if !result.messages.is_empty() {
                    self.undispatched
                        .push_back((block.height(), result.messages.clone()));
                }
                self.dispatch();
            }
            self.reporter.report(activity);
        }
    }

    /// Dispatch queued cross-shard messages in height order, stopping at the first failure.
    ///
    /// A failed height stays at the front of the queue until a later tick or executed block.
    fn dispatch(&mut self) {
        while let Some((height, messages)) = self.undispatched.front() {
            match self.aggregator.dispatch(*height, messages) {
                Ok(sent) => {
                    self.metrics.envelopes.inc_by(sent as u64);
                    self.undispatched.pop_front();
                }
                Err(err) => {
                    self.metrics.dispatch_failures.inc();
                    warn!(
                        height,
                        queued = self.undispatched.len(),
                        ?err,
                        "failed to dispatch messages"
                    );
                    return;
                }
            }
        }
    }
}
