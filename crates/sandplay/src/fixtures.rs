//! Resolver answering API calls from a JSON fixture file.
//!
//! The file is an object whose keys are `"METHOD url"`, e.g.
//! `{"GET /messages": {"messages": []}}`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use sandbus::ApiRequest;
use sandbus::ApiResolver;
use sandbus::ResolveError;
use sandrun::ApiAction;

#[derive(Default, Debug)]
pub struct FixtureResolver {
    responses: HashMap<String, Value>,
}

impl FixtureResolver {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixtures {}", path.display()))?;
        let responses: HashMap<String, Value> = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixtures {}", path.display()))?;
        Ok(Self { responses })
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

fn key(action: ApiAction, url: &str) -> String {
    format!("{} {}", action.as_str().to_uppercase(), url)
}

#[async_trait]
impl ApiResolver for FixtureResolver {
    async fn resolve(&self, request: ApiRequest) -> Result<Value, ResolveError> {
        let key = key(request.action, &request.url);
        self.responses
            .get(&key)
            .cloned()
            .ok_or(ResolveError::NotFound(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use sandbus::ContextId;

    fn request(action: ApiAction, url: &str) -> ApiRequest {
        ApiRequest {
            context: ContextId(1),
            action,
            url: url.into(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_fixture_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(&path, r#"{"GET /messages": {"messages": ["hi"]}, "DELETE /messages/1": null}"#).unwrap();

        let resolver = FixtureResolver::from_file(&path).unwrap();
        assert_eq!(resolver.len(), 2);

        assert_eq!(
            resolver.resolve(request(ApiAction::Get, "/messages")).await,
            Ok(json!({"messages": ["hi"]}))
        );
        assert_eq!(resolver.resolve(request(ApiAction::Delete, "/messages/1")).await, Ok(Value::Null));
        assert_eq!(
            resolver.resolve(request(ApiAction::Post, "/messages")).await,
            Err(ResolveError::NotFound("POST /messages".into()))
        );
    }

    #[test]
    fn test_missing_fixture_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FixtureResolver::from_file(&dir.path().join("absent.json")).is_err());
    }
}
