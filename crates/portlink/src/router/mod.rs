//! Procedure tree.
//!
//! A [`Router`] maps names to procedures or to nested routers. Call paths
//! are resolved by splitting on `.` and walking one segment per level, so a
//! procedure registered as `echo` on a router merged under `greeting` is
//! addressed as `greeting.echo`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use portlink_protocol::CallKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{HandlerError, ProcedureError};
use crate::observable::Observable;

/// Arguments handed to a procedure.
pub struct ProcedureCall<'a, Ctx> {
    /// Context built for the connection.
    pub ctx: &'a Ctx,
    /// Input after the transformer ran, if the caller sent any.
    pub input: Option<Value>,
    /// Full dot-delimited path of the call.
    pub path: &'a str,
    /// Kind requested by the caller.
    pub kind: CallKind,
}

impl<Ctx> ProcedureCall<'_, Ctx> {
    /// Decodes the input as `T`. Absent input decodes from `null`.
    ///
    /// # Errors
    ///
    /// Returns a `BAD_REQUEST` [`ProcedureError`] when the input does not
    /// match `T`.
    pub fn parse_input<T: DeserializeOwned>(&self) -> Result<T, ProcedureError> {
        let raw = self.input.clone().unwrap_or(Value::Null);
        serde_json::from_value(raw).map_err(|error| {
            ProcedureError::bad_request(format!("invalid input: {error}")).with_cause(error)
        })
    }
}

/// Result of a procedure: a single value or a stream of values.
pub enum ProcedureOutput {
    /// A single value answered with one `data` frame.
    Value(Value),
    /// A stream answered with `started`, `data`* and `stopped` or `error`.
    Stream(Observable<Value, ProcedureError>),
}

impl ProcedureOutput {
    /// Serialises a single value.
    ///
    /// # Errors
    ///
    /// Returns an `INTERNAL_SERVER_ERROR` when `value` cannot be
    /// represented as JSON.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProcedureError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|error| HandlerError::Serialize(error).into())
    }
}

impl fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

type Resolver<Ctx> =
    Arc<dyn Fn(ProcedureCall<'_, Ctx>) -> Result<ProcedureOutput, ProcedureError> + Send + Sync>;

/// A registered procedure.
pub struct Procedure<Ctx> {
    kind: CallKind,
    resolver: Resolver<Ctx>,
}

impl<Ctx> Procedure<Ctx> {
    /// Returns the kind the procedure was registered as.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        self.kind
    }

    /// Runs the procedure.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ProcedureError`] the procedure raises.
    pub fn call(&self, call: ProcedureCall<'_, Ctx>) -> Result<ProcedureOutput, ProcedureError> {
        (self.resolver)(call)
    }
}

enum Node<Ctx> {
    Procedure(Procedure<Ctx>),
    Router(Router<Ctx>),
}

/// Tree of named procedures.
///
/// # Examples
///
/// ```
/// use portlink::router::Router;
/// use portlink::ProcedureError;
///
/// let greeting = Router::<()>::new().query("echo", |_ctx: &(), name: String| {
///     Ok::<_, ProcedureError>(format!("hello {name}"))
/// });
/// let router = Router::new().merge("greeting", greeting);
/// assert!(router.resolve("greeting.echo").is_ok());
/// assert!(router.resolve("greeting.missing").is_err());
/// ```
pub struct Router<Ctx> {
    nodes: BTreeMap<String, Node<Ctx>>,
}

impl<Ctx> Default for Router<Ctx> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }
}

impl<Ctx: 'static> Router<Ctx> {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw procedure working directly on [`ProcedureCall`].
    #[must_use]
    pub fn procedure<F>(mut self, name: impl Into<String>, kind: CallKind, resolver: F) -> Self
    where
        F: Fn(ProcedureCall<'_, Ctx>) -> Result<ProcedureOutput, ProcedureError>
            + Send
            + Sync
            + 'static,
    {
        self.nodes.insert(
            name.into(),
            Node::Procedure(Procedure {
                kind,
                resolver: Arc::new(resolver),
            }),
        );
        self
    }

    /// Registers a query taking `I` and answering with `O`.
    #[must_use]
    pub fn query<I, O, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(&Ctx, I) -> Result<O, ProcedureError> + Send + Sync + 'static,
    {
        self.procedure(name, CallKind::Query, typed_value(handler))
    }

    /// Registers a mutation taking `I` and answering with `O`.
    #[must_use]
    pub fn mutation<I, O, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(&Ctx, I) -> Result<O, ProcedureError> + Send + Sync + 'static,
    {
        self.procedure(name, CallKind::Mutation, typed_value(handler))
    }

    /// Registers a subscription taking `I` and streaming `O` values.
    #[must_use]
    pub fn subscription<I, O, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize + Send + 'static,
        F: Fn(&Ctx, I) -> Result<Observable<O, ProcedureError>, ProcedureError>
            + Send
            + Sync
            + 'static,
    {
        self.procedure(name, CallKind::Subscription, move |call| {
            let input = call.parse_input::<I>()?;
            let stream = handler(call.ctx, input)?.try_map(|value: O| {
                serde_json::to_value(value).map_err(|error| HandlerError::Serialize(error).into())
            });
            Ok(ProcedureOutput::Stream(stream))
        })
    }

    /// Nests `router` under `prefix`.
    #[must_use]
    pub fn merge(mut self, prefix: impl Into<String>, router: Self) -> Self {
        self.nodes.insert(prefix.into(), Node::Router(router));
        self
    }

    /// Finds the procedure addressed by a dot-delimited path.
    ///
    /// # Errors
    ///
    /// Returns a `NOT_FOUND` [`ProcedureError`] when a segment is missing or
    /// the path ends on a nested router.
    pub fn resolve(&self, path: &str) -> Result<&Procedure<Ctx>, ProcedureError> {
        let mut router = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match router.nodes.get(segment) {
                Some(Node::Router(nested)) if segments.peek().is_some() => router = nested,
                Some(Node::Procedure(procedure)) if segments.peek().is_none() => {
                    return Ok(procedure);
                }
                _ => break,
            }
        }
        Err(ProcedureError::not_found(format!(
            "No procedure found on path \"{path}\""
        )))
    }

    /// Returns every procedure path in lexical order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths("", &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        for (name, node) in &self.nodes {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match node {
                Node::Procedure(_) => paths.push(path),
                Node::Router(nested) => nested.collect_paths(&path, paths),
            }
        }
    }
}

fn typed_value<Ctx, I, O, F>(
    handler: F,
) -> impl Fn(ProcedureCall<'_, Ctx>) -> Result<ProcedureOutput, ProcedureError> + Send + Sync + 'static
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&Ctx, I) -> Result<O, ProcedureError> + Send + Sync + 'static,
{
    move |call| {
        let input = call.parse_input::<I>()?;
        let output = handler(call.ctx, input)?;
        ProcedureOutput::value(&output)
    }
}
