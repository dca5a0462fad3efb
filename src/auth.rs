//! Authentication of clients to the pooler, and of the pooler to backends.

use crate::backend::BoxedIo;
use crate::policy::Rule;
use crate::protocol::{self, Message, Startup, Tag};
use crate::stream::PgStream;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// Authentication request codes
const AUTH_OK: u32 = 0;
const AUTH_CLEARTEXT_PASSWORD: u32 = 3;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Protocol error")]
    Protocol(#[from] protocol::Error),

    #[error("Expected a password, got {0}")]
    UnexpectedMessage(Tag),

    #[error("Password rejected")]
    Rejected,

    #[error("Unsupported authentication request {0}")]
    Unsupported(u32),

    #[error("Server asked for a password, but none is configured")]
    MissingPassword,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Describes how clients and servers authenticate.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates a client which has been routed by `rule`.
    ///
    /// On success, the client must have been sent an AuthenticationOk
    /// (it may still be buffered). On failure, the implementation may
    /// leave an ErrorResponse in the write buffer.
    async fn authenticate_client(
        &self,
        client: &mut PgStream<BoxedIo>,
        startup: &Startup,
        rule: &Rule,
    ) -> Result<(), Error>;

    /// Answers an Authentication `request` from a backend.
    async fn authenticate_server(
        &self,
        server: &mut PgStream<BoxedIo>,
        request: &Message,
        rule: &Rule,
    ) -> Result<(), Error>;
}

pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Trust or cleartext password authentication.
///
/// Clients are trusted unless their rule has a `password`, in which case
/// they must send it in cleartext. Backends asking for a cleartext password
/// are sent the rule's `storage_password`.
pub struct Basic;

#[async_trait]
impl Authenticator for Basic {
    async fn authenticate_client(
        &self,
        client: &mut PgStream<BoxedIo>,
        _startup: &Startup,
        rule: &Rule,
    ) -> Result<(), Error> {
        if let Some(expected) = &rule.password {
            protocol::put_authentication(client.write_buf(), AUTH_CLEARTEXT_PASSWORD);
            client.flush().await?;

            let msg = client.read_message().await?;
            if msg.tag() != Tag::PASSWORD {
                return Err(Error::UnexpectedMessage(msg.tag()));
            }
            if protocol::password(&msg)? != *expected {
                protocol::put_error_response(
                    client.write_buf(),
                    "FATAL",
                    "28P01",
                    "password authentication failed",
                );
                return Err(Error::Rejected);
            }
        }
        protocol::put_authentication(client.write_buf(), AUTH_OK);
        Ok(())
    }

    async fn authenticate_server(
        &self,
        server: &mut PgStream<BoxedIo>,
        request: &Message,
        rule: &Rule,
    ) -> Result<(), Error> {
        match protocol::auth_code(request)? {
            AUTH_CLEARTEXT_PASSWORD => {
                let password = rule
                    .storage_password
                    .as_deref()
                    .ok_or(Error::MissingPassword)?;
                protocol::put_password(server.write_buf(), password);
                server.flush().await?;
                Ok(())
            }
            code => Err(Error::Unsupported(code)),
        }
    }
}
