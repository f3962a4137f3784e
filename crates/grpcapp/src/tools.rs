use crate::{
    Config,
    auth::{Claims, JwtToken},
    database::Database,
};
use http::Extensions;
use std::sync::Arc;
use tracing::Dispatch;

/// Shared resources handed to every [`Implementation`] before it is
/// registered.
///
/// Cloning is cheap; every clone refers to the same config, logger and
/// database handle.
#[derive(Debug, Clone)]
pub struct Tools {
    config: Arc<Config>,
    logger: Dispatch,
    db: Option<Database>,
}

impl Tools {
    pub(crate) fn new(config: Arc<Config>, logger: Dispatch, db: Option<Database>) -> Self {
        Self { config, logger, db }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The process logger. Useful to log from threads that do not inherit
    /// the global default, via [`tracing::dispatcher::with_default`].
    pub fn logger(&self) -> &Dispatch {
        &self.logger
    }

    /// The database handle, when a DSN was configured or a handle supplied.
    pub fn db(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// The verified token of the current call, if JWT authentication ran on
    /// it.
    ///
    /// ```ignore
    /// async fn whoami(&self, request: Request<()>) -> Result<Response<Reply>, Status> {
    ///     let token = self.tools.jwt_token(request.extensions());
    ///     // ...
    /// }
    /// ```
    pub fn jwt_token<'a>(&self, extensions: &'a Extensions) -> Option<&'a JwtToken> {
        extensions.get::<JwtToken>()
    }

    /// Claims of the verified token of the current call.
    pub fn jwt_claims<'a>(&self, extensions: &'a Extensions) -> Option<&'a Claims> {
        self.jwt_token(extensions).map(JwtToken::claims)
    }
}

/// A gRPC service implementation that receives [`Tools`] exactly once, right
/// before its server is registered.
pub trait Implementation: Send + 'static {
    fn use_tools(&mut self, tools: &Tools);
}
