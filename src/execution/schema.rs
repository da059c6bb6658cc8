//! Minimal subscription engine.
//!
//! A [`Schema`] is a registry of subscription root fields, each bound to a
//! resolver that returns an [`EventStream`]. Every payload the stream
//! yields becomes one [`ExecutionResult`]: the payload is unwrapped by the
//! root field name when it carries that key, then projected onto the
//! field's selection set.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};

use super::document::{Document, Field, OperationKind};
use super::result::{ExecutionResult, GraphQLError};
use super::{ExecutionEngine, OperationContext, SubscribeOutcome};
use crate::pubsub::EventStream;

/// Input passed to a subscription resolver.
#[derive(Debug, Clone)]
pub struct ResolverArgs {
    /// Field arguments with variables already substituted.
    pub arguments: Map<String, Value>,
    /// Operation context (connection, operation id, principal).
    pub context: OperationContext,
}

impl ResolverArgs {
    /// Returns argument `name` as a string, if it is one.
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    /// Returns argument `name` as an unsigned integer, if it is one.
    #[must_use]
    pub fn u64(&self, name: &str) -> Option<u64> {
        self.arguments.get(name).and_then(Value::as_u64)
    }
}

/// Resolver for one subscription root field.
pub type SubscriptionResolver =
    Arc<dyn Fn(ResolverArgs) -> Result<EventStream, GraphQLError> + Send + Sync>;

/// Subscription engine over a fixed set of root fields.
#[derive(Clone, Default)]
pub struct Schema {
    fields: Arc<BTreeMap<String, SubscriptionResolver>>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("subscriptions", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    fields: BTreeMap<String, SubscriptionResolver>,
}

impl fmt::Debug for SchemaBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBuilder")
            .field("subscriptions", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaBuilder {
    /// Registers subscription root field `name`.
    #[must_use]
    pub fn subscription<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(ResolverArgs) -> Result<EventStream, GraphQLError> + Send + Sync + 'static,
    {
        self.fields.insert(name.into(), Arc::new(resolver));
        self
    }

    /// Finishes the schema.
    #[must_use]
    pub fn build(self) -> Schema {
        Schema {
            fields: Arc::new(self.fields),
        }
    }
}

impl Schema {
    /// Starts building a schema.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Names of the registered subscription fields.
    pub fn subscription_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn execute(
        &self,
        document: &Document,
        variables: Option<Map<String, Value>>,
        operation_name: Option<&str>,
        context: &OperationContext,
    ) -> Result<SubscribeOutcome, GraphQLError> {
        let operation = document.operation(operation_name)?;
        if operation.kind != OperationKind::Subscription {
            return Err(GraphQLError::new(
                "Only subscription operations can be executed over this transport.",
            )
            .at(operation.location));
        }
        let [field] = operation.selection.as_slice() else {
            let label = operation
                .name
                .as_deref()
                .map_or_else(|| "Anonymous Subscription".to_string(), |n| format!("Subscription '{n}'"));
            return Err(GraphQLError::new(format!("{label} must select only one top level field."))
                .at(operation.location));
        };
        let Some(resolver) = self.fields.get(&field.name) else {
            return Err(GraphQLError::new(format!(
                "Cannot query field '{}' on type 'Subscription'.",
                field.name
            ))
            .at(field.location));
        };

        let mut values = operation.variable_defaults.clone();
        values.extend(variables.unwrap_or_default());
        let args = ResolverArgs {
            arguments: field.resolve_arguments(&values),
            context: context.clone(),
        };
        let events = resolver(args).map_err(|err| {
            err.at(field.location)
                .with_path(vec![json!(field.response_key())])
        })?;

        let field = field.clone();
        let results = events.map(move |payload| Ok(render(&field, &payload)));
        Ok(SubscribeOutcome::Stream(results.boxed()))
    }
}

#[async_trait]
impl ExecutionEngine for Schema {
    fn parse(&self, query: &str) -> Result<Document, GraphQLError> {
        Document::parse(query)
    }

    async fn subscribe(
        &self,
        document: &Document,
        variables: Option<Map<String, Value>>,
        operation_name: Option<&str>,
        context: &OperationContext,
    ) -> Result<SubscribeOutcome, GraphQLError> {
        Ok(self
            .execute(document, variables, operation_name, context)
            .unwrap_or_else(|err| SubscribeOutcome::Immediate(ExecutionResult::from_error(err))))
    }
}

/// Builds the result for one event of root `field`.
fn render(field: &Field, payload: &Value) -> ExecutionResult {
    let value = match payload {
        Value::Object(map) => map.get(&field.name).unwrap_or(payload),
        _ => payload,
    };
    let mut data = Map::new();
    data.insert(
        field.response_key().to_string(),
        project(value, &field.selection),
    );
    ExecutionResult::from_data(Value::Object(data))
}

fn project(value: &Value, selection: &[Field]) -> Value {
    if selection.is_empty() {
        return value.clone();
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|i| project(i, selection)).collect()),
        Value::Object(map) => Value::Object(
            selection
                .iter()
                .map(|field| {
                    let projected = map
                        .get(&field.name)
                        .map_or(Value::Null, |v| project(v, &field.selection));
                    (field.response_key().to_string(), projected)
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::pubsub::{PubSub, PubSubEngine};

    fn context() -> OperationContext {
        OperationContext {
            connection_id: Uuid::new_v4(),
            operation_id: "1".to_string(),
            principal: None,
        }
    }

    fn schema(bus: &PubSub) -> Schema {
        let bus = bus.clone();
        Schema::builder()
            .subscription("postAdded", move |args| {
                let engine: Arc<dyn PubSubEngine> = Arc::new(bus.clone());
                let stream = EventStream::topics(engine, ["POST_ADDED"]);
                Ok(match args.str("author").map(str::to_string) {
                    Some(author) => stream.filter(move |payload| {
                        payload.pointer("/postAdded/author").and_then(Value::as_str)
                            == Some(author.as_str())
                    }),
                    None => stream,
                })
            })
            .subscription("broken", |_| Err(GraphQLError::new("resolver exploded")))
            .build()
    }

    async fn subscribe(schema: &Schema, query: &str, vars: Option<Value>) -> SubscribeOutcome {
        let Ok(doc) = schema.parse(query) else {
            panic!("parse failed");
        };
        let vars = vars.and_then(|v| v.as_object().cloned());
        let Ok(outcome) = schema.subscribe(&doc, vars, None, &context()).await else {
            panic!("subscribe failed");
        };
        outcome
    }

    fn immediate_message(outcome: SubscribeOutcome) -> String {
        let SubscribeOutcome::Immediate(result) = outcome else {
            panic!("expected an immediate result");
        };
        assert!(result.data.is_none());
        let Some(err) = result.errors.first() else {
            panic!("expected an error");
        };
        err.message.clone()
    }

    async fn wait_for_subscriber(bus: &PubSub) {
        for _ in 0..100 {
            if bus.subscriber_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no subscriber registered");
    }

    #[tokio::test]
    async fn stream_projects_payload_onto_selection() {
        let bus = PubSub::new();
        let schema = schema(&bus);
        let outcome = subscribe(&schema, "subscription { postAdded { author } }", None).await;
        let SubscribeOutcome::Stream(mut results) = outcome else {
            panic!("expected a stream");
        };

        let reader = tokio::spawn(async move { results.next().await });
        wait_for_subscriber(&bus).await;
        let _ = bus
            .publish(
                "POST_ADDED",
                json!({"postAdded": {"author": "Jack", "comment": "hi"}}),
            )
            .await;

        let Ok(Some(Ok(result))) = reader.await else {
            panic!("expected a result");
        };
        assert_eq!(
            result.data,
            Some(json!({"postAdded": {"author": "Jack"}}))
        );
    }

    #[tokio::test]
    async fn variables_reach_the_resolver() {
        let bus = PubSub::new();
        let schema = schema(&bus);
        let outcome = subscribe(
            &schema,
            "subscription OnPost($who: String) { feed: postAdded(author: $who) { comment } }",
            Some(json!({"who": "Jack"})),
        )
        .await;
        let SubscribeOutcome::Stream(mut results) = outcome else {
            panic!("expected a stream");
        };

        let reader = tokio::spawn(async move { results.next().await });
        wait_for_subscriber(&bus).await;
        let _ = bus
            .publish("POST_ADDED", json!({"postAdded": {"author": "Jill", "comment": "no"}}))
            .await;
        let _ = bus
            .publish("POST_ADDED", json!({"postAdded": {"author": "Jack", "comment": "yes"}}))
            .await;

        let Ok(Some(Ok(result))) = reader.await else {
            panic!("expected a result");
        };
        assert_eq!(result.data, Some(json!({"feed": {"comment": "yes"}})));
    }

    #[tokio::test]
    async fn unknown_field_is_an_immediate_error() {
        let schema = schema(&PubSub::new());
        let outcome = subscribe(&schema, "subscription { nope }", None).await;
        assert!(immediate_message(outcome).contains("Cannot query field 'nope'"));
    }

    #[tokio::test]
    async fn queries_are_rejected() {
        let schema = schema(&PubSub::new());
        let outcome = subscribe(&schema, "query { postAdded { author } }", None).await;
        assert!(immediate_message(outcome).contains("Only subscription operations"));
    }

    #[tokio::test]
    async fn multiple_root_fields_are_rejected() {
        let schema = schema(&PubSub::new());
        let outcome = subscribe(&schema, "subscription { postAdded { author } broken }", None).await;
        assert!(immediate_message(outcome).contains("only one top level field"));
    }

    #[tokio::test]
    async fn resolver_error_carries_path() {
        let schema = schema(&PubSub::new());
        let outcome = subscribe(&schema, "subscription { broken }", None).await;
        let SubscribeOutcome::Immediate(result) = outcome else {
            panic!("expected an immediate result");
        };
        let Some(err) = result.errors.first() else {
            panic!("expected an error");
        };
        assert_eq!(err.path, Some(vec![json!("broken")]));
    }

    #[test]
    fn projection_handles_lists_and_missing_fields() {
        let Ok(doc) = Document::parse("subscription { posts { author extra } }") else {
            panic!("parse failed");
        };
        let Some(field) = doc.operations.first().and_then(|op| op.selection.first()) else {
            panic!("missing field");
        };
        let result = render(field, &json!([{"author": "A"}, {"author": "B", "x": 1}]));
        assert_eq!(
            result.data,
            Some(json!({"posts": [
                {"author": "A", "extra": null},
                {"author": "B", "extra": null}
            ]}))
        );
    }

    #[test]
    fn lists_registered_fields() {
        let schema = schema(&PubSub::new());
        let fields: Vec<&str> = schema.subscription_fields().collect();
        assert_eq!(fields, ["broken", "postAdded"]);
    }
}
