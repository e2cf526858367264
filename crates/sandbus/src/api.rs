//! # API extension
//!
//! Answers the API manager's declared actions. Every `invoke` is decoded
//! into an [`ApiRequest`], handed to the [`ApiResolver`] on a spawned task,
//! and answered on `invoke-result:{id}`. Failures never cross the boundary
//! as anything but an error marker: they are logged under a report id and
//! the reply carries that id and a message.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use sandrpc::Channel;
use sandrpc::ChannelKey;
use sandrpc::INVOKE_EVENT;
use sandrpc::Invoke;
use sandrpc::InvokeReply;
use sandrpc::RemoteError;
use sandrpc::reply_event;
use sandrun::API_KEY;
use sandrun::ApiAction;

use crate::bus::ContextId;
use crate::extension::Extension;
use crate::report::report_error;

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    UnknownAction(String),
    BadRequest(String),
    NotFound(String),
    Failed(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAction(action) => write!(f, "Unknown action '{}'", action),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Failed(msg) => write!(f, "Request failed: {}", msg),
        }
    }
}

impl std::error::Error for ResolveError {}

/// One API call made by a guest.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub context: ContextId,
    pub action: ApiAction,
    pub url: String,
    /// Present for `post` and `put`.
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn from_invoke(context: ContextId, invoke: &Invoke) -> Result<Self, ResolveError> {
        let action: ApiAction = invoke
            .action
            .parse()
            .map_err(|_| ResolveError::UnknownAction(invoke.action.clone()))?;

        let url = match invoke.arguments.first() {
            Some(Value::String(url)) => url.clone(),
            _ => return Err(ResolveError::BadRequest("first argument must be a url".into())),
        };

        let body = if action.has_body() {
            Some(invoke.arguments.get(1).cloned().unwrap_or(Value::Null))
        } else {
            None
        };

        Ok(Self {
            context,
            action,
            url,
            body,
        })
    }
}

/// Resolves API calls on behalf of guests.
#[async_trait]
pub trait ApiResolver: Send + Sync + 'static {
    async fn resolve(&self, request: ApiRequest) -> Result<Value, ResolveError>;
}

/// Resolver used when none is configured; every request is not found.
pub struct Unrouted;

#[async_trait]
impl ApiResolver for Unrouted {
    async fn resolve(&self, request: ApiRequest) -> Result<Value, ResolveError> {
        Err(ResolveError::NotFound(format!("{} {}", request.action, request.url)))
    }
}

pub struct ApiExtension {
    resolver: Arc<dyn ApiResolver>,
}

impl ApiExtension {
    pub fn new(resolver: Arc<dyn ApiResolver>) -> Self {
        Self { resolver }
    }
}

impl Extension for ApiExtension {
    fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(API_KEY)
    }

    fn attach(&self, context: ContextId, channel: &Channel) {
        let resolver = self.resolver.clone();
        let replies = channel.clone();

        let _invoke = channel.subscribe(INVOKE_EVENT, move |payload| {
            let invoke: Invoke = match serde_json::from_value(payload.clone()) {
                Ok(invoke) => invoke,
                Err(e) => {
                    tracing::warn!(%context, error = %e, "undecodable invoke");
                    return;
                }
            };
            tracing::debug!(%context, id = invoke.id, action = %invoke.action, "api invoke");

            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                let error = ResolveError::Failed("no async runtime".into());
                send_reply(&replies, failure(invoke.id, &error));
                return;
            };

            let resolver = resolver.clone();
            let replies = replies.clone();
            runtime.spawn(async move {
                let reply = match ApiRequest::from_invoke(context, &invoke) {
                    Ok(request) => match resolver.resolve(request).await {
                        Ok(value) => InvokeReply::ok(invoke.id, value),
                        Err(e) => failure(invoke.id, &e),
                    },
                    Err(e) => failure(invoke.id, &e),
                };
                send_reply(&replies, reply);
            });
        });
    }
}

fn failure(id: u64, error: &ResolveError) -> InvokeReply {
    let report = report_error(error);
    InvokeReply::err(
        id,
        RemoteError {
            report: report.to_string(),
            message: error.to_string(),
        },
    )
}

fn send_reply(channel: &Channel, reply: InvokeReply) {
    let event = reply_event(reply.id);
    match serde_json::to_value(&reply) {
        Ok(value) => channel.publish(&event, value),
        Err(e) => tracing::warn!(%event, error = %e, "unencodable reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn invoke(action: &str, arguments: Vec<Value>) -> Invoke {
        Invoke {
            id: 1,
            action: action.into(),
            arguments,
        }
    }

    #[test]
    fn test_request_from_invoke() {
        let request =
            ApiRequest::from_invoke(ContextId(1), &invoke("post", vec![json!("/a"), json!({"x": 1})]))
                .unwrap();
        assert_eq!(request.action, ApiAction::Post);
        assert_eq!(request.url, "/a");
        assert_eq!(request.body, Some(json!({"x": 1})));

        let request = ApiRequest::from_invoke(ContextId(1), &invoke("get", vec![json!("/a"), json!(1)])).unwrap();
        assert_eq!(request.body, None);
    }

    #[test]
    fn test_bad_requests() {
        assert_eq!(
            ApiRequest::from_invoke(ContextId(1), &invoke("patch", vec![json!("/a")])),
            Err(ResolveError::UnknownAction("patch".into()))
        );
        assert!(matches!(
            ApiRequest::from_invoke(ContextId(1), &invoke("get", vec![])),
            Err(ResolveError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_reply_carries_marker() {
        let channel = Channel::new(API_KEY);
        ApiExtension::new(Arc::new(Unrouted)).attach(ContextId(1), &channel);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        channel.subscribe(reply_event(9), move |payload| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(payload.clone());
            }
        });
        let request = Invoke {
            id: 9,
            action: "get".into(),
            arguments: vec![json!("/missing")],
        };
        channel.publish(INVOKE_EVENT, serde_json::to_value(request).unwrap());

        let reply: InvokeReply = serde_json::from_value(rx.await.unwrap()).unwrap();
        let error = reply.into_result().unwrap_err();
        assert_eq!(error.report.len(), 16);
        assert!(error.message.contains("/missing"));
    }
}
