use super::Error;
use crate::{store, store::PendingEntry, types::Block, Height};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Messages processed, in order, by the [super::Actor].
pub enum Message {
    /// Begin producing a block every interval.
    Start,
    /// Stop producing blocks and forget the duplicate window.
    Stop,
    /// Produce a block now (ignored while stopped).
    Tick,
    /// Add an agreed block to the pending store.
    Block {
        block: Block,
        response: oneshot::Sender<Result<(), store::Error>>,
    },
    /// Fetch a pending or persisted block.
    GetBlock {
        height: Height,
        response: oneshot::Sender<Result<PendingEntry, store::Error>>,
    },
    /// Resynchronize the pending store with the ledger.
    Reload { response: oneshot::Sender<Height> },
    /// Report the chained height.
    Chained { response: oneshot::Sender<Height> },
}

/// Handle for sending messages to the [super::Actor].
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.sender.send(message).await.map_err(|_| Error::Closed)
    }

    pub async fn start(&mut self) -> Result<(), Error> {
        self.send(Message::Start).await
    }

    pub async fn stop(&mut self) -> Result<(), Error> {
        self.send(Message::Stop).await
    }

    pub async fn tick(&mut self) -> Result<(), Error> {
        self.send(Message::Tick).await
    }

    /// Add a block and wait for the store to process it.
    pub async fn block(&mut self, block: Block) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        self.send(Message::Block { block, response }).await?;
        receiver.await.map_err(|_| Error::Closed)??;
        Ok(())
    }

    pub async fn get_block(&mut self, height: Height) -> Result<PendingEntry, Error> {
        let (response, receiver) = oneshot::channel();
        self.send(Message::GetBlock { height, response }).await?;
        Ok(receiver.await.map_err(|_| Error::Closed)??)
    }

    /// Reload from the ledger, returning the resulting chained height.
    pub async fn reload(&mut self) -> Result<Height, Error> {
        let (response, receiver) = oneshot::channel();
        self.send(Message::Reload { response }).await?;
        receiver.await.map_err(|_| Error::Closed)
    }

    pub async fn chained(&mut self) -> Result<Height, Error> {
        let (response, receiver) = oneshot::channel();
        self.send(Message::Chained { response }).await?;
        receiver.await.map_err(|_| Error::Closed)
    }
}
