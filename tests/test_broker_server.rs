//! BrokerServer behavior tests
//!
//! Drive the broker through its public API with mock transports and mock
//! plugins, checking what ends up queued, delivered and reported.


use async_trait::async_trait;
use mgmt_broker::error::BrokerError;
use mgmt_broker::protocol::{message_from_value, ExchangeResponse, Message, OperationStatus};
use mgmt_broker::registry::{BrokerClient, ClientError, Connector, ConnectorContext};
use mgmt_broker::testing::mocks::{failing_factory, mock_factory, MockClient};
use mgmt_broker::BrokerHandle;
use serde_json::{json, Value};
use std::sync::Arc;
use test_helpers::{test_broker, TestBroker};

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_messages_delivered_in_call_order() {
    let TestBroker {
        broker, transport, ..
    } = test_broker();
    broker.store().set_accepted_types(["test"]).unwrap();
    let session = broker.get_session_id().unwrap();

    let ids: Vec<_> = (0..5)
        .map(|n| {
            broker
                .send_message(
                    message_from_value(json!({"type": "test", "n": n})),
                    Some(&session),
                    false,
                )
                .unwrap()
                .unwrap()
        })
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0].0 < pair[1].0));

    assert!(broker.exchanger().exchange(false).await.is_completed());

    let payloads = transport.get_payloads().await;
    let numbers: Vec<_> = payloads[0].messages.iter().map(|m| m["n"].clone()).collect();
    assert_eq!(numbers, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    assert_eq!(payloads[0].sequence, ids[0].0);
}

#[tokio::test]
async fn test_pending_until_acknowledged() {
    let TestBroker {
        broker, transport, ..
    } = test_broker();
    broker.store().set_accepted_types(["test"]).unwrap();
    let session = broker.get_session_id().unwrap();
    let id = broker
        .send_message(message_from_value(json!({"type": "test"})), Some(&session), false)
        .unwrap()
        .unwrap();

    // Server has not caught up yet
    transport
        .queue_response(ExchangeResponse {
            next_expected_sequence: Some(id.0),
            ..Default::default()
        })
        .await;
    broker.exchanger().exchange(false).await;
    assert!(broker.is_message_pending(id).unwrap());

    broker.exchanger().exchange(false).await;
    assert!(!broker.is_message_pending(id).unwrap());
}

#[tokio::test]
async fn test_stale_session_dropped_silently() {
    let TestBroker { broker, store, .. } = test_broker();
    store.set_accepted_types(["test"]).unwrap();
    let session = broker.get_session_id().unwrap();
    store.drop_session_ids().unwrap();

    let result = broker
        .send_message(message_from_value(json!({"type": "test"})), Some(&session), true)
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(store.pending_count(), 0);
    assert!(!broker.exchanger().is_urgent());
}

#[tokio::test]
async fn test_missing_session_is_error() {
    let TestBroker { broker, store, .. } = test_broker();
    store.set_accepted_types(["test"]).unwrap();

    let result = broker.send_message(message_from_value(json!({"type": "test"})), None, false);
    assert!(matches!(result, Err(BrokerError::MissingSession)));
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_urgent_message_requests_urgent_exchange() {
    let TestBroker { broker, store, .. } = test_broker();
    store.set_accepted_types(["test"]).unwrap();
    let session = broker.get_session_id().unwrap();

    broker
        .send_message(message_from_value(json!({"type": "test"})), Some(&session), true)
        .unwrap();
    assert!(broker.exchanger().is_urgent());
}

#[tokio::test]
async fn test_client_accepted_type_registered_once() {
    let TestBroker { broker, .. } = test_broker();
    let before = broker.get_client_accepted_message_types().len();

    assert!(broker.register_client_accepted_message_type("type1"));
    assert!(!broker.register_client_accepted_message_type("type1"));

    let types = broker.get_client_accepted_message_types();
    assert_eq!(types.len(), before + 1);
    assert_eq!(types.iter().filter(|t| *t == "type1").count(), 1);
}

#[tokio::test]
async fn test_listen_events_resolves_on_first() {
    let TestBroker { broker, .. } = test_broker();
    let wait = broker.listen_events(&["event1", "event2"]);

    broker.fire_event("event2", &[json!(1)]);
    broker.fire_event("event1", &[]);

    let fired = wait.await.unwrap();
    assert_eq!(fired.name, "event2");
    assert_eq!(fired.args, vec![json!(1)]);
    assert_eq!(broker.events().subscriber_count("event1"), 0);
    assert_eq!(broker.events().subscriber_count("event2"), 0);
}

#[tokio::test]
async fn test_stop_clients_calls_every_exit() {
    let TestBroker { broker, .. } = test_broker();
    let good = Arc::new(MockClient::new("good"));
    let bad = Arc::new(MockClient::new("bad").with_exit_failure());
    broker.registry().add_connector_factory("good", mock_factory(good.clone()));
    broker.registry().add_connector_factory("bad", mock_factory(bad.clone()));
    broker.register_client("bad").await.unwrap();
    broker.register_client("good").await.unwrap();

    let result = broker.stop_clients().await;

    assert!(matches!(
        result,
        Err(BrokerError::Client(ClientError::ExitFailed { .. }))
    ));
    assert_eq!(good.exit_count().await, 1);
    assert_eq!(bad.exit_count().await, 1);
    assert!(broker.get_clients().is_empty());
}

#[tokio::test]
async fn test_stop_clients_succeeds_when_all_exit() {
    let TestBroker { broker, .. } = test_broker();
    let client = Arc::new(MockClient::new("foo"));
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();

    broker.stop_clients().await.unwrap();
    assert_eq!(client.exit_count().await, 1);
}

#[tokio::test]
async fn test_register_client_lookups() {
    let TestBroker { broker, .. } = test_broker();
    let client = Arc::new(MockClient::new("foo"));
    broker.registry().add_connector_factory("foo", mock_factory(client));
    broker.registry().add_connector_factory("broken", failing_factory("broken", "refused"));

    broker.register_client("foo").await.unwrap();
    assert!(matches!(
        broker.register_client("broken").await,
        Err(BrokerError::Client(ClientError::ConnectFailed { .. }))
    ));
    assert!(matches!(
        broker.register_client("missing").await,
        Err(BrokerError::UnknownConnector(_))
    ));

    assert_eq!(broker.get_clients().len(), 1);
    assert_eq!(broker.get_connectors().len(), 1);
    assert_eq!(broker.get_client("foo").unwrap().name(), "foo");
    assert!(broker.get_connector("foo").is_some());
    assert!(broker.get_client("broken").is_none());
}

#[tokio::test]
async fn test_broadcasts_aggregate_results() {
    let TestBroker { broker, .. } = test_broker();
    let first = Arc::new(MockClient::new("first").with_event_result(json!("a")));
    let second = Arc::new(MockClient::new("second").with_event_result(json!("b")));
    broker.registry().add_connector_factory("first", mock_factory(first.clone()));
    broker.registry().add_connector_factory("second", mock_factory(second.clone()));
    broker.register_client("first").await.unwrap();
    broker.register_client("second").await.unwrap();

    assert_eq!(broker.impending_exchange().await.unwrap(), vec![json!("a"), json!("b")]);
    broker.resynchronize(json!(["computer"])).await.unwrap();
    broker.broker_reconnect().await.unwrap();
    broker.server_uuid_changed(None, Some("uuid")).await.unwrap();
    broker.message_type_acceptance_changed("type", true).await.unwrap();
    broker.package_data_changed().await.unwrap();

    let events = first.get_events().await;
    assert_eq!(
        events,
        vec![
            ("impending-exchange".to_string(), vec![]),
            ("resynchronize".to_string(), vec![json!(["computer"])]),
            ("broker-reconnect".to_string(), vec![]),
            ("server-uuid-changed".to_string(), vec![json!(null), json!("uuid")]),
            (
                "message-type-acceptance-changed".to_string(),
                vec![json!("type"), json!(true)]
            ),
            ("package-data-changed".to_string(), vec![]),
        ]
    );
    assert_eq!(second.get_events().await.len(), 6);
}

#[tokio::test]
async fn test_unhandled_message_reports_failed_operation() {
    let TestBroker {
        broker, transport, store, ..
    } = test_broker();
    store.set_accepted_types(["operation-result"]).unwrap();
    let client = Arc::new(MockClient::new("foo").handling(&["something-else"]));
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();

    transport
        .queue_response(ExchangeResponse {
            messages: vec![message_from_value(
                json!({"type": "foobar", "operation-id": 4}),
            )],
            ..Default::default()
        })
        .await;
    broker.exchanger().exchange(false).await;

    assert_eq!(client.get_messages().await.len(), 1);
    let pending = store.get_pending_messages(None).unwrap();
    assert_eq!(pending.len(), 1);
    let result = &pending[0].payload;
    assert_eq!(result["type"], json!("operation-result"));
    assert_eq!(result["status"], json!(OperationStatus::Failed.code()));
    assert_eq!(result["operation-id"], json!(4));
    assert!(broker.exchanger().is_urgent());
}

#[tokio::test]
async fn test_handled_message_is_not_reported() {
    let TestBroker {
        broker, transport, store, ..
    } = test_broker();
    store.set_accepted_types(["operation-result"]).unwrap();
    let client = Arc::new(MockClient::new("foo").handling(&["foobar"]));
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();

    transport
        .queue_response(ExchangeResponse {
            messages: vec![message_from_value(
                json!({"type": "foobar", "operation-id": 4}),
            )],
            ..Default::default()
        })
        .await;
    broker.exchanger().exchange(false).await;

    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_exit_stops_broker_even_if_client_fails() {
    let TestBroker { broker, .. } = test_broker();
    let client = Arc::new(MockClient::new("foo").with_exit_failure());
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();
    let pre_exit = broker.listen_events(&["pre-exit"]);

    let result = broker.exit().await;

    assert!(result.is_err());
    assert!(!broker.is_running());
    assert!(broker.exchanger().is_stopped());
    assert_eq!(pre_exit.await.unwrap().name, "pre-exit");
    broker.wait_stopped().await;
}

#[tokio::test]
async fn test_registration_succeeds_on_set_id() {
    let TestBroker {
        broker, transport, store, ..
    } = test_broker();
    transport
        .queue_response(ExchangeResponse {
            messages: vec![message_from_value(
                json!({"type": "set-id", "id": "secure", "insecure-id": 7}),
            )],
            ..Default::default()
        })
        .await;

    let exchanger = broker.exchanger().clone();
    let (registered, _) = tokio::join!(broker.register(), async move {
        settle().await;
        exchanger.exchange(true).await
    });
    registered.unwrap();

    let payloads = transport.get_payloads().await;
    let register = &payloads[0].messages[0];
    assert_eq!(register["type"], json!("register"));
    assert_eq!(register["computer-title"], json!("Test Computer"));
    assert_eq!(register["account-name"], json!("test-account"));

    let identity = store.get_identity().unwrap().unwrap();
    assert_eq!(identity.secure_id, "secure");
    assert_eq!(identity.insecure_id.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_registration_failure() {
    let TestBroker {
        broker, transport, ..
    } = test_broker();
    transport
        .queue_response(ExchangeResponse {
            messages: vec![message_from_value(json!({"type": "registration-failed"}))],
            ..Default::default()
        })
        .await;

    let exchanger = broker.exchanger().clone();
    let (registered, _) = tokio::join!(broker.register(), async move {
        settle().await;
        exchanger.exchange(true).await
    });
    assert!(matches!(registered, Err(BrokerError::RegistrationFailed)));
}

#[tokio::test]
async fn test_server_resynchronize_reaches_clients() {
    let TestBroker {
        broker, transport, store, ..
    } = test_broker();
    let client = Arc::new(MockClient::new("foo"));
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();
    let session = store.get_session_id().unwrap();

    transport
        .queue_response(ExchangeResponse {
            messages: vec![message_from_value(
                json!({"type": "resynchronize", "scopes": ["package"]}),
            )],
            ..Default::default()
        })
        .await;
    broker.exchanger().exchange(false).await;
    settle().await;

    assert_ne!(store.get_session_id().unwrap(), session);
    let events = client.get_events().await;
    assert!(events.contains(&("resynchronize".to_string(), vec![json!(["package"])])));
}

#[tokio::test]
async fn test_accepted_types_from_server() {
    let TestBroker {
        broker, transport, ..
    } = test_broker();
    let client = Arc::new(MockClient::new("foo"));
    broker.registry().add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();

    transport
        .queue_response(ExchangeResponse {
            accepted_types: Some(vec!["b".to_string(), "a".to_string()]),
            server_uuid: Some("uuid-1".to_string()),
            ..Default::default()
        })
        .await;
    broker.exchanger().exchange(false).await;
    settle().await;

    assert_eq!(
        broker.get_accepted_message_types().unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(broker.get_server_uuid().unwrap().as_deref(), Some("uuid-1"));

    let events = client.get_events().await;
    assert!(events.contains(&(
        "message-type-acceptance-changed".to_string(),
        vec![json!("a"), json!(true)]
    )));
    assert!(events.contains(&(
        "server-uuid-changed".to_string(),
        vec![json!(null), json!("uuid-1")]
    )));
}

/// Plugin that queues a report each time an exchange is announced
struct ReportingClient {
    broker: BrokerHandle,
}

#[async_trait]
impl BrokerClient for ReportingClient {
    fn name(&self) -> &str {
        "reporter"
    }

    async fn message(&self, _message: &Message) -> Result<bool, ClientError> {
        Ok(false)
    }

    async fn fire_event(&self, event: &str, _args: &[Value]) -> Result<Value, ClientError> {
        if event == "impending-exchange" {
            let queue = |broker: &BrokerHandle| -> Result<(), BrokerError> {
                let session = broker.get_session_id()?;
                broker.send_message(
                    message_from_value(json!({"type": "test", "source": "reporter"})),
                    Some(&session),
                    false,
                )?;
                Ok(())
            };
            queue(&self.broker)
                .map_err(|e| ClientError::event_failed("reporter", event, e.to_string()))?;
        }
        Ok(Value::Null)
    }

    async fn exit(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

struct ReportingConnector {
    broker: BrokerHandle,
}

#[async_trait]
impl Connector for ReportingConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, ClientError> {
        Ok(Arc::new(ReportingClient {
            broker: self.broker.clone(),
        }))
    }
}

#[tokio::test]
async fn test_data_queued_on_impending_exchange_joins_that_exchange() {
    let TestBroker {
        broker, transport, store, ..
    } = test_broker();
    store.set_accepted_types(["test"]).unwrap();
    broker.registry().add_connector_factory(
        "reporter",
        Arc::new(|context: &ConnectorContext| {
            Arc::new(ReportingConnector {
                broker: context.broker.clone(),
            }) as Arc<dyn Connector>
        }),
    );
    broker.register_client("reporter").await.unwrap();

    assert!(broker.exchanger().exchange(false).await.is_completed());

    let payloads = transport.get_payloads().await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].messages.len(), 1);
    assert_eq!(payloads[0].messages[0]["source"], json!("reporter"));
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_impending_exchange_reaches_clients_once_per_cycle() {
    let TestBroker { broker, .. } = test_broker();
    let client = Arc::new(MockClient::new("foo"));
    broker
        .registry()
        .add_connector_factory("foo", mock_factory(client.clone()));
    broker.register_client("foo").await.unwrap();

    broker.exchanger().exchange(false).await;
    settle().await;

    assert_eq!(
        client.get_events().await,
        vec![("impending-exchange".to_string(), vec![])]
    );
}
