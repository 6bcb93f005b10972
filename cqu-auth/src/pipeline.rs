//! Runs request procedures against either a blocking or an async transport.
//!
//! A [`Procedure`] is written once as async code that sends every request through an
//! [`Executor`]. [`Pipeline::run_sync`] drives it with an executor that blocks on a [`Transport`]
//! and therefore never actually suspends; [`Pipeline::run_async`] drives it with an executor that
//! awaits an [`AsyncTransport`]. The branching logic in between is shared, so both modes issue the
//! exact same requests.

use futures::future::BoxFuture;
use hyper::HeaderMap;
use tracing::debug;

use crate::{
    config::Config,
    transport::{AsyncTransport, Request, Response, Transport, TransportError},
};

/// Sends the requests of a running procedure.
pub trait Executor: Send {
    fn execute(&mut self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;

    /// Headers the underlying transport sends with every request.
    fn headers_mut(&mut self) -> &mut HeaderMap;
}

/// A sequence of requests whose next step depends on the previous response.
///
/// Procedures compose by awaiting another procedure's [`run`](Procedure::run) with the same
/// executor, which keeps the whole chain in one execution mode.
pub trait Procedure: Send {
    type Output: Send;
    type Error: From<TransportError> + Send;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<Self::Output, Self::Error>>
    where
        Self: 'a;
}

trait DynProcedure<T, E>: Send {
    fn run_boxed<'a>(self: Box<Self>, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<T, E>>;
}

impl<P> DynProcedure<P::Output, P::Error> for P
where
    P: Procedure + 'static,
{
    fn run_boxed<'a>(
        self: Box<Self>,
        executor: &'a mut dyn Executor,
    ) -> BoxFuture<'a, Result<P::Output, P::Error>> {
        (*self).run(executor)
    }
}

/// A type-erased [`Procedure`].
pub struct BoxProcedure<T, E>(Box<dyn DynProcedure<T, E>>);

impl<T, E> BoxProcedure<T, E> {
    pub fn new<P>(procedure: P) -> Self
    where
        P: Procedure<Output = T, Error = E> + 'static,
    {
        Self(Box::new(procedure))
    }
}

impl<T, E> std::fmt::Debug for BoxProcedure<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxProcedure")
    }
}

impl<T, E> Procedure for BoxProcedure<T, E>
where
    T: Send,
    E: From<TransportError> + Send,
{
    type Output = T;
    type Error = E;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<T, E>>
    where
        Self: 'a,
    {
        self.0.run_boxed(executor)
    }
}

/// Drives procedures against a caller-owned transport.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `procedure`, blocking the calling thread on every request.
    pub fn run_sync<T, P>(&self, transport: &mut T, procedure: P) -> Result<P::Output, P::Error>
    where
        T: Transport + ?Sized,
        P: Procedure,
    {
        let mut executor = Blocking {
            transport,
            config: &self.config,
        };
        futures::executor::block_on(procedure.run(&mut executor))
    }

    /// Runs `procedure`, suspending the calling task while each response is pending.
    pub async fn run_async<T, P>(&self, transport: &mut T, procedure: P) -> Result<P::Output, P::Error>
    where
        T: AsyncTransport + ?Sized,
        P: Procedure,
    {
        let mut executor = Suspending {
            transport,
            config: &self.config,
        };
        procedure.run(&mut executor).await
    }
}

struct Blocking<'a, T: ?Sized> {
    transport: &'a mut T,
    config: &'a Config,
}

impl<T> Executor for Blocking<'_, T>
where
    T: Transport + ?Sized,
{
    fn execute(&mut self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        let request = self.config.apply(request);
        Box::pin(async move {
            log_request(&request);
            let response = self.transport.execute(&request);
            log_response(&request, &response);
            response
        })
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.transport.headers_mut()
    }
}

struct Suspending<'a, T: ?Sized> {
    transport: &'a mut T,
    config: &'a Config,
}

impl<T> Executor for Suspending<'_, T>
where
    T: AsyncTransport + ?Sized,
{
    fn execute(&mut self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        let request = self.config.apply(request);
        Box::pin(async move {
            log_request(&request);
            let response = self.transport.execute(&request).await;
            log_response(&request, &response);
            response
        })
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.transport.headers_mut()
    }
}

fn log_request(request: &Request) {
    debug!(
        method = %request.method,
        url = %request.url,
        redirects = ?request.redirects,
        "sending request"
    );
}

fn log_response(request: &Request, response: &Result<Response, TransportError>) {
    match response {
        Ok(response) => debug!(
            method = %request.method,
            url = %request.url,
            status = %response.status(),
            "received response"
        ),
        Err(err) => debug!(method = %request.method, url = %request.url, error = %err, "request failed"),
    }
}
