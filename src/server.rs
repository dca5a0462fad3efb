//! Connections from the pooler to a backend.

use crate::backend::{BoxedIo, Error};
use crate::protocol::{self, CancelKey, Message, Tag, TransactionStatus};
use crate::stream::PgStream;
use crate::ServerId;

use tracing::{event, Level};

/// A live connection to a backend.
///
/// Tracks how many requests which expect a ReadyForQuery have been sent,
/// and how many ReadyForQuery messages have been received: the connection
/// is "synchronized" when the two are equal.
#[derive(Debug)]
pub struct ServerConnection {
    id: ServerId,
    stream: PgStream<BoxedIo>,
    key: CancelKey,
    parameters: Vec<(String, String)>,
    count_request: u64,
    count_reply: u64,
    is_transaction: bool,
    is_copy: bool,
}

impl ServerConnection {
    pub(crate) fn new(id: ServerId, stream: PgStream<BoxedIo>) -> Self {
        Self {
            id,
            stream,
            key: CancelKey::default(),
            parameters: Vec::new(),
            count_request: 0,
            count_reply: 0,
            is_transaction: false,
            is_copy: false,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The key which cancels queries running on this connection.
    pub fn key(&self) -> CancelKey {
        self.key
    }

    /// Parameters reported by the backend through ParameterStatus.
    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn is_transaction(&self) -> bool {
        self.is_transaction
    }

    pub fn is_copy(&self) -> bool {
        self.is_copy
    }

    pub fn is_synchronized(&self) -> bool {
        self.count_request == self.count_reply
    }

    pub(crate) fn stream_mut(&mut self) -> &mut PgStream<BoxedIo> {
        &mut self.stream
    }

    pub(crate) fn set_key(&mut self, key: CancelKey) {
        self.key = key;
    }

    pub(crate) fn record_parameter(&mut self, msg: &Message) -> Result<(), protocol::Error> {
        let (name, value) = protocol::parameter_status(msg)?;
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.parameters.push((name, value)),
        }
        Ok(())
    }

    pub(crate) async fn startup(&mut self, params: &[(&str, &str)]) -> Result<(), Error> {
        protocol::put_startup_message(self.stream.write_buf(), params);
        // The backend answers a StartupMessage with a ReadyForQuery.
        self.count_request += 1;
        self.stream.flush().await?;
        Ok(())
    }

    /// Buffers a message from a client, to be sent on the next flush.
    pub fn forward(&mut self, msg: &Message) {
        let tag = msg.tag();
        if tag.expects_ready() {
            self.count_request += 1;
        }
        if tag == Tag::COPY_DONE || tag == Tag::COPY_FAIL {
            self.is_copy = false;
        }
        self.stream.put(msg.as_bytes());
    }

    /// The number of bytes buffered by [Self::forward] and not yet flushed.
    pub(crate) fn pending_write(&self) -> usize {
        self.stream.pending_write()
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }

    pub async fn read_message(&mut self) -> std::io::Result<Message> {
        self.stream.read_message().await
    }

    /// Handles a ReadyForQuery message.
    pub fn ready(&mut self, msg: &Message) -> Result<TransactionStatus, protocol::Error> {
        let status = protocol::ready_status(msg)?;
        self.is_transaction = status != TransactionStatus::Idle;
        if self.count_reply < self.count_request {
            self.count_reply += 1;
        } else {
            event!(
                Level::WARN,
                server = %self.id,
                "Received ReadyForQuery without an outstanding request"
            );
        }
        Ok(status)
    }

    /// Updates the connection state from a message the backend sent.
    ///
    /// Returns the transaction status if the message was a ReadyForQuery.
    pub fn observe(&mut self, msg: &Message) -> Result<Option<TransactionStatus>, protocol::Error> {
        match msg.tag() {
            Tag::READY_FOR_QUERY => return self.ready(msg).map(Some),
            Tag::COPY_IN_RESPONSE | Tag::COPY_OUT_RESPONSE => self.is_copy = true,
            Tag::COPY_DONE => self.is_copy = false,
            Tag::PARAMETER_STATUS => self.record_parameter(msg)?,
            _ => (),
        }
        Ok(None)
    }

    /// Runs a simple query, discarding its results.
    pub(crate) async fn query(&mut self, sql: &str) -> Result<(), Error> {
        protocol::put_query(self.stream.write_buf(), sql);
        self.count_request += 1;
        self.stream.flush().await?;

        let mut error = None;
        loop {
            let msg = self.read_message().await?;
            match msg.tag() {
                Tag::ERROR_RESPONSE => error = Some(protocol::error_fields(&msg)),
                Tag::READY_FOR_QUERY => {
                    self.ready(&msg)?;
                    if self.is_synchronized() {
                        break;
                    }
                }
                _ => {
                    self.observe(&msg)?;
                }
            }
        }
        match error {
            Some(fields) => Err(Error::Server(fields)),
            None => Ok(()),
        }
    }

    pub fn is_connected(&mut self) -> bool {
        self.stream.is_connected()
    }

    /// Sends a Terminate (if the backend is still there) and closes the
    /// connection.
    pub(crate) async fn close(mut self) {
        if self.stream.is_connected() {
            protocol::put_terminate(self.stream.write_buf());
            let _ = self.stream.flush().await;
        }
        let _ = self.stream.shutdown().await;
        event!(Level::DEBUG, server = %self.id, "Closed server connection");
    }

    /// Parks the connection while no client is using it.
    pub(crate) fn detach(self) -> Detached {
        Detached(self)
    }
}

/// A server connection parked in its pool.
///
/// No I/O can be performed through a detached connection: it must be
/// attached to a client (through [crate::claim::Handle]) first.
#[derive(Debug)]
pub struct Detached(ServerConnection);

impl Detached {
    pub fn id(&self) -> ServerId {
        self.0.id
    }

    pub fn key(&self) -> CancelKey {
        self.0.key
    }

    /// Checks if the backend has hung up, without blocking.
    pub(crate) fn is_connected(&mut self) -> bool {
        self.0.is_connected()
    }

    pub(crate) fn attach(self) -> ServerConnection {
        self.0
    }

    pub(crate) async fn close(self) {
        self.0.close().await
    }
}
