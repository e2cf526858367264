//! API manager: remotes the four HTTP verbs to the host.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use sandrpc::Channel;
use sandrpc::Manager;
use sandrpc::PendingCall;
use sandrpc::REPLY_PREFIX;
use sandrpc::RESET_EVENT;
use sandrpc::RemoteAction;

/// Channel key of the API manager.
pub const API_KEY: &str = "api";

/// The actions the API manager declares, with their wire names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ApiAction {
    Get,
    Post,
    Put,
    Delete,
}

impl ApiAction {
    pub const ALL: [ApiAction; 4] = [Self::Get, Self::Post, Self::Put, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }

    /// Whether the action carries a body after the url.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown API action '{}'", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for ApiAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

pub struct ApiManager {
    channel: Channel,
}

impl ApiManager {
    /// On `reset`, every call still waiting on this channel is abandoned.
    pub fn new(channel: Channel) -> Self {
        let replies = channel.clone();
        let _reset = channel.subscribe(RESET_EVENT, move |_| {
            let abandoned = replies.unsubscribe_prefix(REPLY_PREFIX);
            if abandoned > 0 {
                tracing::debug!(abandoned, "api calls abandoned on reset");
            }
        });

        Self { channel }
    }
}

impl Manager for ApiManager {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn actions(&self) -> &[&'static str] {
        &["get", "post", "put", "delete"]
    }
}

/// Typed facade over the API manager's declared actions.
#[derive(Clone)]
pub struct ApiFacade {
    manager: Arc<ApiManager>,
}

impl ApiFacade {
    pub fn new(manager: Arc<ApiManager>) -> Self {
        Self { manager }
    }

    pub fn invoke(&self, action: ApiAction, arguments: Vec<Value>) -> PendingCall {
        RemoteAction::new(self.manager.channel().clone(), action.as_str()).invoke(arguments)
    }

    pub fn get(&self, url: &str) -> PendingCall {
        self.invoke(ApiAction::Get, vec![Value::from(url)])
    }

    pub fn post(&self, url: &str, body: Value) -> PendingCall {
        self.invoke(ApiAction::Post, vec![Value::from(url), body])
    }

    pub fn put(&self, url: &str, body: Value) -> PendingCall {
        self.invoke(ApiAction::Put, vec![Value::from(url), body])
    }

    pub fn delete(&self, url: &str) -> PendingCall {
        self.invoke(ApiAction::Delete, vec![Value::from(url)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sandrpc::ActionDispatcher;
    use sandrpc::InvokeError;
    use sandrpc::Member;
    use sandrpc::reply_event;

    #[test]
    fn test_action_names_round_trip_through_from_str() {
        for action in ApiAction::ALL {
            assert_eq!(action.as_str().parse::<ApiAction>().unwrap(), action);
        }
        assert_eq!("patch".parse::<ApiAction>(), Err(UnknownAction("patch".into())));
    }

    #[test]
    fn test_declared_actions_match_enum() {
        let manager = ApiManager::new(Channel::new(API_KEY));
        let declared: Vec<&str> = ApiAction::ALL.iter().map(|a| a.as_str()).collect();
        assert_eq!(manager.actions(), declared.as_slice());

        let dispatcher = ActionDispatcher::new(Arc::new(manager));
        assert!(matches!(dispatcher.resolve("get"), Some(Member::Action(_))));
        assert!(dispatcher.resolve("fetch").is_none());
    }

    #[tokio::test]
    async fn test_reset_abandons_waiting_calls() {
        let channel = Channel::new(API_KEY);
        let api = ApiFacade::new(Arc::new(ApiManager::new(channel.clone())));
        let first = api.get("/messages");
        let second = api.delete("/messages/1");
        let reply = reply_event(first.id());

        channel.publish(RESET_EVENT, Value::Null);

        assert_eq!(first.await.unwrap_err(), InvokeError::Abandoned);
        assert_eq!(second.await.unwrap_err(), InvokeError::Abandoned);
        assert_eq!(channel.subscriber_count(&reply), 0);
        assert_eq!(channel.subscriber_count(RESET_EVENT), 1);
    }
}
