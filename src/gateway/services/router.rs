//! Invocation path: validation, resolution, selection and failover.

use super::{
    FailoverLedger, MetricsCollector, RegistryError, SelectionContext, SelectionStrategy,
    ServerRegistry,
};
use crate::gateway::{
    domain::{CallOutcome, ServerId, ServerRecord, ToolDescriptor, ToolName},
    ports::{ToolServerTransport, TransportError},
};
use mockable::Clock;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors surfaced to callers of [`ToolRouter::invoke`].
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    /// No server declares the tool.
    #[error("tool {0} is not provided by any registered server")]
    NotFound(ToolName),

    /// Providers exist but every eligible one was exhausted.
    #[error("tool {tool} is unavailable after {attempts} attempt(s)")]
    Unavailable {
        /// Requested tool.
        tool: ToolName,
        /// Providers tried.
        attempts: u32,
        /// Transient failure of the final attempt, when one was made.
        last: Option<TransportError>,
    },

    /// The caller's deadline elapsed.
    #[error("tool {tool} timed out after {attempts} attempt(s)")]
    Timeout {
        /// Requested tool.
        tool: ToolName,
        /// Providers tried before the deadline elapsed.
        attempts: u32,
    },

    /// The arguments were rejected before or by a provider.
    #[error("invalid arguments for tool {tool}: {reason}")]
    Validation {
        /// Requested tool.
        tool: ToolName,
        /// What was wrong.
        reason: String,
    },

    /// The tool ran and reported a failure.
    #[error("tool {tool} failed on {server_id} with code {code}: {message}")]
    Application {
        /// Requested tool.
        tool: ToolName,
        /// Provider that ran the tool.
        server_id: ServerId,
        /// Provider-defined error code.
        code: i64,
        /// Provider-supplied message.
        message: String,
    },
}

/// Result type for invocations.
pub type InvocationResult<T> = Result<T, InvocationError>;

/// Successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Value returned by the tool.
    pub value: Value,
    /// Provider that produced the value.
    pub server_id: ServerId,
    /// Providers tried, the successful one included.
    pub attempts: u32,
    /// Wall time of the successful attempt.
    pub latency: Duration,
}

/// Checks `args` against the tool's declared input shape.
///
/// `null` is accepted as an empty object.
fn validate_arguments(descriptor: &ToolDescriptor, args: Value) -> InvocationResult<Value> {
    let object = match args {
        Value::Null => Map::new(),
        Value::Object(object) => object,
        other => {
            return Err(InvocationError::Validation {
                tool: descriptor.name.clone(),
                reason: format!("expected a JSON object, got {}", json_type(&other)),
            });
        }
    };

    let missing: Vec<&str> = descriptor
        .required_arguments()
        .into_iter()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(InvocationError::Validation {
            tool: descriptor.name.clone(),
            reason: format!("missing required argument(s): {}", missing.join(", ")),
        });
    }

    Ok(Value::Object(object))
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Routes tool invocations to providers with failover.
pub struct ToolRouter<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    registry: Arc<ServerRegistry<C>>,
    transport: Arc<T>,
    metrics: Arc<MetricsCollector<C>>,
    strategy: Arc<dyn SelectionStrategy>,
    failovers: Arc<FailoverLedger>,
    max_attempts: u32,
    ewma_alpha: f64,
}

impl<T, C> ToolRouter<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    /// Creates a router over shared gateway state.
    #[must_use]
    pub fn new(
        registry: Arc<ServerRegistry<C>>,
        transport: Arc<T>,
        metrics: Arc<MetricsCollector<C>>,
        strategy: Arc<dyn SelectionStrategy>,
        failovers: Arc<FailoverLedger>,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
            strategy,
            failovers,
            max_attempts: 3,
            ewma_alpha: 0.3,
        }
    }

    /// Sets the maximum number of providers tried per call (minimum one).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the weight of a new sample in the latency estimate.
    #[must_use]
    pub const fn with_ewma_alpha(mut self, alpha: f64) -> Self {
        self.ewma_alpha = alpha;
        self
    }

    /// Returns the active selection strategy.
    #[must_use]
    pub fn strategy(&self) -> &dyn SelectionStrategy {
        self.strategy.as_ref()
    }

    fn eligible(&self, tool: &ToolName, tried: &[ServerId]) -> InvocationResult<Vec<ServerRecord>> {
        let candidates = self
            .registry
            .candidates(tool)
            .map_err(|err| match err {
                RegistryError::UnknownTool(name) => InvocationError::NotFound(name),
                RegistryError::Conflict { .. }
                | RegistryError::NotFound(_)
                | RegistryError::Domain(_) => InvocationError::NotFound(tool.clone()),
            })?;
        Ok(candidates
            .into_iter()
            .filter(|record| !tried.contains(record.id()))
            .collect())
    }

    fn record(&self, server_id: &ServerId, tool: &ToolName, latency: Duration, outcome: CallOutcome) {
        self.metrics.record(server_id, tool, latency, outcome);
        if matches!(outcome, CallOutcome::Success | CallOutcome::Timeout) {
            self.registry
                .observe_latency(server_id, latency, self.ewma_alpha);
        }
    }

    /// Invokes `tool` with `args`, giving up at `deadline`.
    ///
    /// Transient failures (timeouts and transport errors) are retried on the
    /// next eligible provider until `max_attempts` providers were tried or
    /// none is left. Validation and application failures are returned at
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::NotFound`] for unknown tools,
    /// [`InvocationError::Validation`] for malformed or rejected arguments,
    /// [`InvocationError::Application`] when the tool reports a failure,
    /// [`InvocationError::Timeout`] when the deadline elapses and
    /// [`InvocationError::Unavailable`] when providers are exhausted.
    pub async fn invoke(
        &self,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> InvocationResult<ToolResponse> {
        let descriptor = self
            .registry
            .tool(tool)
            .ok_or_else(|| InvocationError::NotFound(tool.clone()))?;
        let arguments = validate_arguments(&descriptor, args)?;

        let mut tried: Vec<ServerId> = Vec::new();
        let mut last: Option<TransportError> = None;

        for attempt in 0..self.max_attempts {
            if Instant::now() >= deadline {
                return Err(InvocationError::Timeout {
                    tool: tool.clone(),
                    attempts: attempt,
                });
            }

            let candidates = self.eligible(tool, &tried)?;
            let context = SelectionContext::retry(attempt, &tried);
            let Some(chosen) = self.strategy.select(&candidates, tool, &context) else {
                break;
            };
            let Some(server) = candidates.iter().find(|record| record.id() == &chosen) else {
                break;
            };

            debug!(server_id = %chosen, %tool, attempt, "dispatching tool call");
            let started = Instant::now();
            let outcome = self
                .transport
                .invoke(server, tool, arguments.clone(), deadline)
                .await;
            let latency = started.elapsed();
            let attempts = attempt.saturating_add(1);

            match outcome {
                Ok(value) => {
                    self.record(&chosen, tool, latency, CallOutcome::Success);
                    return Ok(ToolResponse {
                        value,
                        server_id: chosen,
                        attempts,
                        latency,
                    });
                }
                Err(err) => {
                    self.record(&chosen, tool, latency, err.outcome());
                    if !err.is_transient() {
                        return Err(terminal_error(tool, chosen, err));
                    }
                    warn!(server_id = %chosen, %tool, attempt, error = %err, "provider failed, trying next candidate");
                    self.failovers.record(&chosen);
                    tried.push(chosen);
                    last = Some(err);
                }
            }
        }

        let attempts = u32::try_from(tried.len()).unwrap_or(u32::MAX);
        if matches!(last, Some(TransportError::Timeout(_))) && Instant::now() >= deadline {
            return Err(InvocationError::Timeout {
                tool: tool.clone(),
                attempts,
            });
        }
        Err(InvocationError::Unavailable {
            tool: tool.clone(),
            attempts,
            last,
        })
    }
}

fn terminal_error(tool: &ToolName, server_id: ServerId, err: TransportError) -> InvocationError {
    match err {
        TransportError::Rejected(reason) => InvocationError::Validation {
            tool: tool.clone(),
            reason,
        },
        TransportError::Application { code, message } => InvocationError::Application {
            tool: tool.clone(),
            server_id,
            code,
            message,
        },
        other => InvocationError::Application {
            tool: tool.clone(),
            server_id,
            code: 0,
            message: other.to_string(),
        },
    }
}
