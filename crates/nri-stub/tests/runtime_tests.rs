use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;
use futures::SinkExt;
use futures::StreamExt;
use nri_api::ConfigureRequest;
use nri_api::ConfigureResponse;
use nri_api::Container;
use nri_api::ContainerAdjustment;
use nri_api::CreateContainerRequest;
use nri_api::CreateContainerResponse;
use nri_api::Empty;
use nri_api::Event;
use nri_api::EventMask;
use nri_api::PodSandbox;
use nri_api::RegisterPluginRequest;
use nri_api::StateChangeEvent;
use nri_api::StopContainerRequest;
use nri_api::SynchronizeRequest;
use nri_api::SynchronizeResponse;
use nri_api::PLUGIN_SERVICE;
use nri_api::RUNTIME_SERVICE;
use nri_stub::transport::ttrpc::Request;
use nri_stub::transport::ttrpc::Response;
use nri_stub::transport::ConnId;
use nri_stub::transport::MessageType;
use nri_stub::transport::MuxCodec;
use nri_stub::transport::MuxFrame;
use nri_stub::transport::StatusCode;
use nri_stub::transport::TtrpcCodec;
use nri_stub::transport::TtrpcMessage;
use nri_stub::transport::PLUGIN_SERVICE_CONN;
use nri_stub::transport::RUNTIME_SERVICE_CONN;
use nri_stub::EventKind;
use nri_stub::HandlerError;
use nri_stub::LifecycleEvent;
use nri_stub::Plugin;
use nri_stub::Reply;
use nri_stub::Stub;
use nri_stub::StubConfig;
use nri_stub::StubResult;
use prost::Message;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Records every event and pins containers whose pod carries a `cpus` annotation.
#[derive(Default)]
struct RecordingPlugin {
    events: Mutex<Vec<EventKind>>,
    synced: Mutex<Option<(usize, usize)>>,
}

impl RecordingPlugin {
    fn events(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().clone()
    }
}

impl Plugin for RecordingPlugin {
    fn handle(&self, event: LifecycleEvent) -> Result<Reply, HandlerError> {
        self.events.lock().unwrap().push(event.kind());

        match event {
            LifecycleEvent::CreateContainer { pod, .. } => Ok(pod
                .annotations
                .get("cpus")
                .map_or(Reply::Ack, |cpus| {
                    Reply::Adjust(ContainerAdjustment::with_cpuset_cpus(cpus.clone()))
                })),
            LifecycleEvent::StopContainer { container, .. } if container.id == "fail" => {
                Err("stop failed".into())
            }
            LifecycleEvent::Synchronize { pods, containers } => {
                *self.synced.lock().unwrap() = Some((pods.len(), containers.len()));
                Ok(Reply::Ack)
            }
            _ => Ok(Reply::Ack),
        }
    }
}

/// Plays the runtime side of the plugin socket.
struct FakeRuntime {
    framed: Framed<UnixStream, MuxCodec>,
    plugin_rx: BytesMut,
    runtime_rx: BytesMut,
    next_stream_id: u32,
}

impl FakeRuntime {
    fn new(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, MuxCodec),
            plugin_rx: BytesMut::new(),
            runtime_rx: BytesMut::new(),
            next_stream_id: 1,
        }
    }

    async fn next_message(&mut self, conn: ConnId) -> TtrpcMessage {
        loop {
            let buf = if conn == PLUGIN_SERVICE_CONN {
                &mut self.plugin_rx
            } else {
                &mut self.runtime_rx
            };
            if let Some(message) = TtrpcCodec.decode(buf).expect("valid ttrpc message") {
                return message;
            }

            let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("plugin should answer in time")
                .expect("socket should stay open")
                .expect("valid mux frame");
            match frame.conn {
                PLUGIN_SERVICE_CONN => self.plugin_rx.extend_from_slice(&frame.payload),
                RUNTIME_SERVICE_CONN => self.runtime_rx.extend_from_slice(&frame.payload),
                other => panic!("unexpected frame on {other}"),
            }
        }
    }

    async fn send(&mut self, conn: ConnId, message: TtrpcMessage) {
        let mut buf = BytesMut::new();
        TtrpcCodec
            .encode(message, &mut buf)
            .expect("encode ttrpc message");
        self.framed
            .send(MuxFrame::new(conn, buf.freeze()))
            .await
            .expect("send frame");
    }

    async fn answer_registration(&mut self, response: Response) -> RegisterPluginRequest {
        let message = self.next_message(RUNTIME_SERVICE_CONN).await;
        assert_eq!(message.kind, MessageType::Request);

        let request = Request::decode(message.payload).expect("ttrpc request");
        assert_eq!(request.service, RUNTIME_SERVICE);
        assert_eq!(request.method, "RegisterPlugin");
        assert!(request.timeout_nano > 0);

        self.send(
            RUNTIME_SERVICE_CONN,
            TtrpcMessage::response(message.stream_id, &response),
        )
        .await;
        RegisterPluginRequest::decode(request.payload).expect("register payload")
    }

    async fn accept_registration(&mut self) -> RegisterPluginRequest {
        self.answer_registration(Response::ok(Empty {}.encode_to_vec()))
            .await
    }

    async fn call(&mut self, method: &str, payload: &impl Message) -> Response {
        self.call_service(PLUGIN_SERVICE, method, payload).await
    }

    async fn call_service(&mut self, service: &str, method: &str, payload: &impl Message) -> Response {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let request = Request::new(service, method, payload);
        self.send(
            PLUGIN_SERVICE_CONN,
            TtrpcMessage::request(stream_id, &request),
        )
        .await;

        let message = self.next_message(PLUGIN_SERVICE_CONN).await;
        assert_eq!(message.kind, MessageType::Response);
        assert_eq!(message.stream_id, stream_id);
        Response::decode(message.payload).expect("ttrpc response")
    }
}

struct Session {
    runtime: FakeRuntime,
    plugin: Arc<RecordingPlugin>,
    cancel: CancellationToken,
    handle: JoinHandle<StubResult<()>>,
}

fn start_session() -> Session {
    let (plugin_side, runtime_side) = UnixStream::pair().expect("socket pair");
    let config = StubConfig::new("test-plugin")
        .with_plugin_idx("42")
        .with_registration_timeout(Duration::from_millis(300));
    let stub = Stub::from_stream(config, plugin_side);

    let plugin = Arc::new(RecordingPlugin::default());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(stub.run(plugin.clone(), cancel.clone()));

    Session {
        runtime: FakeRuntime::new(runtime_side),
        plugin,
        cancel,
        handle,
    }
}

async fn registered_session() -> Session {
    let mut session = start_session();
    session.runtime.accept_registration().await;
    session
}

fn pod_with(annotations: &[(&str, &str)]) -> PodSandbox {
    PodSandbox {
        id: "pod-1".to_string(),
        name: "demo".to_string(),
        namespace: "default".to_string(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

fn container(id: &str) -> Container {
    Container {
        id: id.to_string(),
        pod_sandbox_id: "pod-1".to_string(),
        name: "app".to_string(),
        ..Default::default()
    }
}

#[test(tokio::test)]
async fn registers_with_configured_identity() {
    let mut session = start_session();

    let registration = session.runtime.accept_registration().await;
    assert_eq!(registration.plugin_name, "test-plugin");
    assert_eq!(registration.plugin_idx, "42");

    drop(session.runtime);
    let result = session.handle.await.expect("stub task");
    assert!(result.is_ok(), "disconnect after registration is a clean exit");
}

#[test(tokio::test)]
async fn configure_subscribes_to_all_events() {
    let mut session = registered_session().await;

    let response = session
        .runtime
        .call(
            "Configure",
            &ConfigureRequest {
                config: String::new(),
                runtime_name: "containerd".to_string(),
                runtime_version: "2.0.0".to_string(),
                registration_timeout: 5000,
                request_timeout: 2000,
            },
        )
        .await;

    assert!(response.is_ok());
    let configured = ConfigureResponse::decode(response.payload).expect("configure response");
    assert_eq!(configured.events, EventMask::all().raw());
    assert_eq!(session.plugin.events(), vec![EventKind::Configure]);
}

#[test(tokio::test)]
async fn create_container_returns_adjustment() {
    let mut session = registered_session().await;

    let response = session
        .runtime
        .call(
            "CreateContainer",
            &CreateContainerRequest {
                pod: Some(pod_with(&[("cpus", "2-3")])),
                container: Some(container("ctr-1")),
            },
        )
        .await;

    assert!(response.is_ok());
    let created = CreateContainerResponse::decode(response.payload).expect("create response");
    let adjust = created.adjust.expect("should carry adjustment");
    assert_eq!(adjust.cpuset_cpus(), Some("2-3"));
    assert!(created.update.is_empty());
}

#[test(tokio::test)]
async fn create_container_without_adjustment_is_empty() {
    let mut session = registered_session().await;

    let response = session
        .runtime
        .call(
            "CreateContainer",
            &CreateContainerRequest {
                pod: Some(pod_with(&[])),
                container: Some(container("ctr-1")),
            },
        )
        .await;

    assert!(response.is_ok());
    let created = CreateContainerResponse::decode(response.payload).expect("create response");
    assert!(created.adjust.is_none());
}

#[test(tokio::test)]
async fn create_container_without_container_is_invalid() {
    let mut session = registered_session().await;

    let response = session
        .runtime
        .call(
            "CreateContainer",
            &CreateContainerRequest {
                pod: Some(pod_with(&[])),
                container: None,
            },
        )
        .await;

    assert_eq!(response.code(), StatusCode::InvalidArgument as i32);
    assert!(session.plugin.events().is_empty());
}

#[test(tokio::test)]
async fn state_changes_are_acknowledged() {
    let mut session = registered_session().await;

    let changes = [
        (Event::RunPodSandbox, None),
        (Event::StartContainer, Some(container("ctr-1"))),
        (Event::RemoveContainer, Some(container("ctr-1"))),
        (Event::RemovePodSandbox, None),
    ];
    for (event, container) in changes {
        let response = session
            .runtime
            .call(
                "StateChange",
                &StateChangeEvent {
                    event: event as i32,
                    pod: Some(pod_with(&[])),
                    container,
                },
            )
            .await;
        assert!(response.is_ok(), "{event} should be acknowledged");
    }

    assert_eq!(
        session.plugin.events(),
        vec![
            EventKind::RunPodSandbox,
            EventKind::StartContainer,
            EventKind::RemoveContainer,
            EventKind::RemovePodSandbox,
        ]
    );
}

#[test(tokio::test)]
async fn requests_are_served_while_registration_is_pending() {
    let mut session = start_session();

    // hold back the registration reply, as containerd does while it
    // configures and synchronizes the plugin
    let registration = session.runtime.next_message(RUNTIME_SERVICE_CONN).await;
    assert_eq!(registration.kind, MessageType::Request);

    let configured = session
        .runtime
        .call("Configure", &ConfigureRequest::default())
        .await;
    assert!(configured.is_ok());
    let configured = ConfigureResponse::decode(configured.payload).expect("configure response");
    assert_eq!(EventMask::from_raw(configured.events), EventMask::all());

    let synced = session
        .runtime
        .call(
            "Synchronize",
            &SynchronizeRequest {
                pods: vec![pod_with(&[("cpus", "1")])],
                containers: vec![container("ctr-0")],
                more: false,
            },
        )
        .await;
    assert!(synced.is_ok());

    session
        .runtime
        .send(
            RUNTIME_SERVICE_CONN,
            TtrpcMessage::response(
                registration.stream_id,
                &Response::ok(Empty {}.encode_to_vec()),
            ),
        )
        .await;

    let created = session
        .runtime
        .call(
            "CreateContainer",
            &CreateContainerRequest {
                pod: Some(pod_with(&[("cpus", "1")])),
                container: Some(container("ctr-1")),
            },
        )
        .await;
    let created = CreateContainerResponse::decode(created.payload).expect("create response");
    assert_eq!(
        created.adjust.as_ref().and_then(|adjust| adjust.cpuset_cpus()),
        Some("1")
    );
    assert_eq!(
        session.plugin.events(),
        vec![
            EventKind::Configure,
            EventKind::Synchronize,
            EventKind::CreateContainer,
        ]
    );

    // a clean exit on hangup proves the late registration reply was accepted
    drop(session.runtime);
    let result = session.handle.await.expect("stub task");
    assert!(result.is_ok());
}

#[test(tokio::test)]
async fn unknown_methods_are_unimplemented() {
    let mut session = registered_session().await;

    let response = session.runtime.call("UpdatePodSandbox", &Empty {}).await;
    assert_eq!(response.code(), StatusCode::Unimplemented as i32);

    let response = session
        .runtime
        .call_service("some.other.Service", "Configure", &Empty {})
        .await;
    assert_eq!(response.code(), StatusCode::Unimplemented as i32);
    assert!(session.plugin.events().is_empty());
}

#[test(tokio::test)]
async fn handler_errors_do_not_end_the_session() {
    let mut session = registered_session().await;

    let response = session
        .runtime
        .call(
            "StopContainer",
            &StopContainerRequest {
                pod: Some(pod_with(&[])),
                container: Some(container("fail")),
            },
        )
        .await;
    assert_eq!(response.code(), StatusCode::Unknown as i32);
    let status = response.status.expect("error status");
    assert!(status.message.contains("stop failed"));

    let response = session
        .runtime
        .call(
            "StopContainer",
            &StopContainerRequest {
                pod: Some(pod_with(&[])),
                container: Some(container("ctr-2")),
            },
        )
        .await;
    assert!(response.is_ok());
}

#[test(tokio::test)]
async fn batched_synchronize_is_delivered_once() {
    let mut session = registered_session().await;

    let first = session
        .runtime
        .call(
            "Synchronize",
            &SynchronizeRequest {
                pods: vec![pod_with(&[])],
                containers: vec![container("a")],
                more: true,
            },
        )
        .await;
    let first = SynchronizeResponse::decode(first.payload).expect("sync response");
    assert!(first.more);
    assert!(session.plugin.events().is_empty());

    let last = session
        .runtime
        .call(
            "Synchronize",
            &SynchronizeRequest {
                pods: vec![pod_with(&[])],
                containers: vec![container("b"), container("c")],
                more: false,
            },
        )
        .await;
    let last = SynchronizeResponse::decode(last.payload).expect("sync response");
    assert!(!last.more);
    assert!(last.update.is_empty());

    assert_eq!(session.plugin.events(), vec![EventKind::Synchronize]);
    assert_eq!(*session.plugin.synced.lock().unwrap(), Some((2, 3)));
}

#[test(tokio::test)]
async fn shutdown_ends_the_session() {
    let mut session = registered_session().await;

    let response = session.runtime.call("Shutdown", &Empty {}).await;
    assert!(response.is_ok());

    let result = session.handle.await.expect("stub task");
    assert!(result.is_ok());
    assert_eq!(session.plugin.events(), vec![EventKind::Shutdown]);
}

#[test(tokio::test)]
async fn cancellation_ends_the_session() {
    let session = registered_session().await;

    session.cancel.cancel();
    let result = session.handle.await.expect("stub task");
    assert!(result.is_ok());
}

#[test(tokio::test)]
async fn rejected_registration_is_fatal() {
    let mut session = start_session();

    session
        .runtime
        .answer_registration(Response::error(StatusCode::Unknown, "plugin 42 already registered"))
        .await;

    let err = session
        .handle
        .await
        .expect("stub task")
        .expect_err("registration should fail");
    assert!(format!("{err:?}").contains("already registered"));
}

#[test(tokio::test)]
async fn missing_registration_reply_times_out() {
    let mut session = start_session();

    // read the request but never answer it
    let _request = session.runtime.next_message(RUNTIME_SERVICE_CONN).await;

    let result = tokio::time::timeout(Duration::from_secs(5), session.handle)
        .await
        .expect("stub should give up on its own")
        .expect("stub task");
    assert!(result.is_err());
}

#[test(tokio::test)]
async fn disconnect_before_registration_is_an_error() {
    let session = start_session();

    drop(session.runtime);
    let result = session.handle.await.expect("stub task");
    assert!(result.is_err());
}

#[test(tokio::test)]
async fn negative_socket_fd_is_refused_before_use() {
    let result = Stub::connect(StubConfig::new("test-plugin").with_socket_fd(Some(-1))).await;
    assert!(result.is_err());
}
