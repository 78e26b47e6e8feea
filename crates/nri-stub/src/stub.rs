//! Plugin side of the runtime connection.
//!
//! The stub owns the socket for the whole session: it registers the plugin,
//! serves the runtime's requests on the plugin service connection and
//! closes the socket when [`Stub::run`] returns.

use std::os::fd::FromRawFd;
use std::os::fd::RawFd;

use bytes::Bytes;
use bytes::BytesMut;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::SinkExt;
use futures::StreamExt;
use nri_api::ConfigureRequest;
use nri_api::ConfigureResponse;
use nri_api::Container;
use nri_api::ContainerUpdate;
use nri_api::CreateContainerRequest;
use nri_api::CreateContainerResponse;
use nri_api::Empty;
use nri_api::EventMask;
use nri_api::PodSandbox;
use nri_api::RegisterPluginRequest;
use nri_api::StateChangeEvent;
use nri_api::StopContainerRequest;
use nri_api::StopContainerResponse;
use nri_api::SynchronizeRequest;
use nri_api::SynchronizeResponse;
use nri_api::UpdateContainerRequest;
use nri_api::UpdateContainerResponse;
use nri_api::PLUGIN_SERVICE;
use nri_api::RUNTIME_SERVICE;
use prost::Message;
use tokio::net::UnixStream;
use tokio::select;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::StubConfig;
use crate::error::StubError;
use crate::error::StubResult;
use crate::event::HandlerError;
use crate::event::LifecycleEvent;
use crate::event::Plugin;
use crate::event::Reply;
use crate::transport::ttrpc::Request;
use crate::transport::ttrpc::Response;
use crate::transport::ConnId;
use crate::transport::MessageType;
use crate::transport::MuxCodec;
use crate::transport::MuxFrame;
use crate::transport::StatusCode;
use crate::transport::TtrpcCodec;
use crate::transport::TtrpcMessage;
use crate::transport::PLUGIN_SERVICE_CONN;
use crate::transport::RUNTIME_SERVICE_CONN;

/// Methods of the plugin service this stub serves.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
enum Method {
    Configure,
    Synchronize,
    Shutdown,
    CreateContainer,
    UpdateContainer,
    StopContainer,
    StateChange,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Configure" => Some(Method::Configure),
            "Synchronize" => Some(Method::Synchronize),
            "Shutdown" => Some(Method::Shutdown),
            "CreateContainer" => Some(Method::CreateContainer),
            "UpdateContainer" => Some(Method::UpdateContainer),
            "StopContainer" => Some(Method::StopContainer),
            "StateChange" => Some(Method::StateChange),
            _ => None,
        }
    }
}

/// Whether the session continues after a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// A request that is answered with an error status.
#[derive(Debug)]
struct Failure {
    code: StatusCode,
    message: String,
}

impl Failure {
    fn invalid(message: impl ToString) -> Self {
        Self {
            code: StatusCode::InvalidArgument,
            message: message.to_string(),
        }
    }

    fn handler(err: HandlerError) -> Self {
        Self {
            code: StatusCode::Unknown,
            message: err.to_string(),
        }
    }
}

/// Synchronize batches received so far.
#[derive(Debug, Default)]
struct SyncBatch {
    pods: Vec<PodSandbox>,
    containers: Vec<Container>,
}

/// Connection to the runtime on behalf of one plugin.
pub struct Stub {
    config: StubConfig,
    framed: Framed<UnixStream, MuxCodec>,
    plugin_rx: BytesMut,
    runtime_rx: BytesMut,
    next_stream_id: u32,
    pending_sync: SyncBatch,
}

impl Stub {
    /// Open the runtime socket described by `config`.
    ///
    /// A pre-connected descriptor takes precedence over the socket path.
    ///
    /// # Errors
    ///
    /// - [`StubError::Configuration`] if the config is invalid
    /// - [`StubError::Connection`] if the socket cannot be opened
    pub async fn connect(config: StubConfig) -> StubResult<Self> {
        config.validate()?;

        let stream = match config.socket_fd {
            Some(fd) => {
                info!(fd, "Using pre-connected runtime socket");
                adopt_socket(fd)?
            }
            None => {
                info!(path = %config.socket_path.display(), "Connecting to runtime socket");
                UnixStream::connect(&config.socket_path)
                    .await
                    .change_context(StubError::Connection {
                        message: format!(
                            "Failed to connect to {}",
                            config.socket_path.display()
                        ),
                    })?
            }
        };

        Ok(Self::from_stream(config, stream))
    }

    /// Wrap an already connected socket.
    pub fn from_stream(config: StubConfig, stream: UnixStream) -> Self {
        Self {
            config,
            framed: Framed::new(stream, MuxCodec),
            plugin_rx: BytesMut::new(),
            runtime_rx: BytesMut::new(),
            next_stream_id: 1,
            pending_sync: SyncBatch::default(),
        }
    }

    /// Register with the runtime and serve its requests until the session ends.
    ///
    /// Returns `Ok(())` when the runtime disconnects after registration, sends
    /// `Shutdown`, or `cancel` fires. The socket is closed on return.
    ///
    /// # Errors
    ///
    /// - [`StubError::Registration`] if the runtime rejects the plugin, does not
    ///   answer within the registration timeout, or disconnects first
    /// - [`StubError::Codec`] / [`StubError::Connection`] on wire failures
    #[tracing::instrument(
        skip_all,
        fields(plugin = %self.config.plugin_name, idx = %self.config.plugin_idx)
    )]
    pub async fn run<P: Plugin>(mut self, plugin: P, cancel: CancellationToken) -> StubResult<()> {
        let register_id = self.register().await?;

        let registration_timeout = self.config.registration_timeout;
        let registration_deadline = tokio::time::sleep(registration_timeout);
        tokio::pin!(registration_deadline);
        let mut registered = false;

        loop {
            let frame = select! {
                _ = cancel.cancelled() => {
                    info!("Plugin stub cancelled");
                    return Ok(());
                }
                _ = &mut registration_deadline, if !registered => {
                    return Err(Report::new(StubError::Timeout {
                        millis: registration_timeout.as_millis(),
                    })
                    .change_context(StubError::Registration {
                        message: "no reply to RegisterPlugin".into(),
                    }));
                }
                frame = self.framed.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    return Err(Report::new(e).change_context(StubError::Codec {
                        message: "Failed to read from runtime socket".into(),
                    }));
                }
                None if registered => {
                    info!("Runtime closed the connection");
                    return Ok(());
                }
                None => {
                    return Err(Report::new(StubError::Registration {
                        message: "connection closed before registration completed".into(),
                    }));
                }
            };

            match frame.conn {
                PLUGIN_SERVICE_CONN => {
                    self.plugin_rx.extend_from_slice(&frame.payload);
                    while let Some(message) = decode_message(&mut self.plugin_rx)? {
                        if self.serve(message, &plugin).await? == Flow::Shutdown {
                            info!("Runtime requested shutdown");
                            return Ok(());
                        }
                    }
                }
                RUNTIME_SERVICE_CONN => {
                    self.runtime_rx.extend_from_slice(&frame.payload);
                    while let Some(message) = decode_message(&mut self.runtime_rx)? {
                        if !registered
                            && message.kind == MessageType::Response
                            && message.stream_id == register_id
                        {
                            check_registration(message.payload)?;
                            registered = true;
                            info!("Plugin registered with runtime");
                        } else {
                            warn!(
                                stream_id = message.stream_id,
                                kind = %message.kind,
                                "Ignoring unexpected message on runtime connection"
                            );
                        }
                    }
                }
                other => debug!(conn = %other, "Dropping frame for unknown connection"),
            }
        }
    }

    async fn register(&mut self) -> StubResult<u32> {
        let payload = RegisterPluginRequest {
            plugin_name: self.config.plugin_name.clone(),
            plugin_idx: self.config.plugin_idx.clone(),
        };
        let request = Request::new(RUNTIME_SERVICE, "RegisterPlugin", &payload)
            .with_timeout(self.config.request_timeout);

        let stream_id = self.allocate_stream_id();
        info!("Registering plugin with runtime");
        self.send(RUNTIME_SERVICE_CONN, TtrpcMessage::request(stream_id, &request))
            .await
            .attach_printable("while sending RegisterPlugin")?;
        Ok(stream_id)
    }

    /// Client stream ids are odd and increase by two.
    fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2);
        id
    }

    async fn serve<P: Plugin>(&mut self, message: TtrpcMessage, plugin: &P) -> StubResult<Flow> {
        if message.kind != MessageType::Request {
            warn!(
                stream_id = message.stream_id,
                kind = %message.kind,
                "Ignoring non-request message on plugin connection"
            );
            return Ok(Flow::Continue);
        }

        let stream_id = message.stream_id;
        let (response, flow) = match Request::decode(message.payload) {
            Ok(request) => self.dispatch(request, plugin),
            Err(e) => (
                Response::error(
                    StatusCode::InvalidArgument,
                    format!("malformed ttrpc request: {e}"),
                ),
                Flow::Continue,
            ),
        };

        self.send(PLUGIN_SERVICE_CONN, TtrpcMessage::response(stream_id, &response))
            .await?;
        Ok(flow)
    }

    fn dispatch<P: Plugin>(&mut self, request: Request, plugin: &P) -> (Response, Flow) {
        let method = match Method::from_name(&request.method) {
            Some(method) if request.service == PLUGIN_SERVICE => method,
            _ => {
                warn!(
                    service = %request.service,
                    method = %request.method,
                    "Unimplemented request from runtime"
                );
                return (
                    Response::error(
                        StatusCode::Unimplemented,
                        format!("{}/{} is not implemented", request.service, request.method),
                    ),
                    Flow::Continue,
                );
            }
        };

        debug!(%method, "Handling runtime request");
        let flow = if method == Method::Shutdown {
            Flow::Shutdown
        } else {
            Flow::Continue
        };

        let response = match self.handle_method(method, request.payload, plugin) {
            Ok(payload) => Response::ok(payload),
            Err(failure) => {
                warn!(%method, code = %failure.code, message = %failure.message, "Request failed");
                Response::error(failure.code, failure.message)
            }
        };
        (response, flow)
    }

    fn handle_method<P: Plugin>(
        &mut self,
        method: Method,
        payload: Bytes,
        plugin: &P,
    ) -> Result<Vec<u8>, Failure> {
        match method {
            Method::Configure => {
                let request = ConfigureRequest::decode(payload).map_err(Failure::invalid)?;
                let mask = match plugin
                    .handle(LifecycleEvent::Configure(request))
                    .map_err(Failure::handler)?
                {
                    Reply::Subscribe(mask) => mask,
                    Reply::Ack => EventMask::all(),
                    other => {
                        ignored_reply(method, &other);
                        EventMask::all()
                    }
                };
                if mask.is_empty() {
                    return Err(Failure {
                        code: StatusCode::Unknown,
                        message: "plugin subscribed to no events".into(),
                    });
                }
                debug!(events = mask.raw(), "Plugin event subscription");
                Ok(ConfigureResponse { events: mask.raw() }.encode_to_vec())
            }
            Method::Synchronize => {
                let request = SynchronizeRequest::decode(payload).map_err(Failure::invalid)?;
                self.pending_sync.pods.extend(request.pods);
                self.pending_sync.containers.extend(request.containers);
                if request.more {
                    return Ok(SynchronizeResponse {
                        update: Vec::new(),
                        more: true,
                    }
                    .encode_to_vec());
                }

                let SyncBatch { pods, containers } = std::mem::take(&mut self.pending_sync);
                let reply = plugin
                    .handle(LifecycleEvent::Synchronize { pods, containers })
                    .map_err(Failure::handler)?;
                Ok(SynchronizeResponse {
                    update: updates_of(method, reply),
                    more: false,
                }
                .encode_to_vec())
            }
            Method::Shutdown => {
                let reply = plugin
                    .handle(LifecycleEvent::Shutdown)
                    .map_err(Failure::handler)?;
                if reply != Reply::Ack {
                    ignored_reply(method, &reply);
                }
                Ok(Empty {}.encode_to_vec())
            }
            Method::CreateContainer => {
                let request = CreateContainerRequest::decode(payload).map_err(Failure::invalid)?;
                let event = LifecycleEvent::CreateContainer {
                    pod: require(request.pod, method, "pod")?,
                    container: require(request.container, method, "container")?,
                };
                let response = match plugin.handle(event).map_err(Failure::handler)? {
                    Reply::Adjust(adjust) => CreateContainerResponse {
                        adjust: Some(adjust),
                        update: Vec::new(),
                    },
                    Reply::Update(update) => CreateContainerResponse {
                        adjust: None,
                        update,
                    },
                    Reply::Ack => CreateContainerResponse::default(),
                    other => {
                        ignored_reply(method, &other);
                        CreateContainerResponse::default()
                    }
                };
                Ok(response.encode_to_vec())
            }
            Method::UpdateContainer => {
                let request = UpdateContainerRequest::decode(payload).map_err(Failure::invalid)?;
                let event = LifecycleEvent::UpdateContainer {
                    pod: require(request.pod, method, "pod")?,
                    container: require(request.container, method, "container")?,
                    resources: request.linux_resources,
                };
                let reply = plugin.handle(event).map_err(Failure::handler)?;
                Ok(UpdateContainerResponse {
                    update: updates_of(method, reply),
                }
                .encode_to_vec())
            }
            Method::StopContainer => {
                let request = StopContainerRequest::decode(payload).map_err(Failure::invalid)?;
                let event = LifecycleEvent::StopContainer {
                    pod: require(request.pod, method, "pod")?,
                    container: require(request.container, method, "container")?,
                };
                let reply = plugin.handle(event).map_err(Failure::handler)?;
                Ok(StopContainerResponse {
                    update: updates_of(method, reply),
                }
                .encode_to_vec())
            }
            Method::StateChange => {
                let change = StateChangeEvent::decode(payload).map_err(Failure::invalid)?;
                let event = LifecycleEvent::try_from(change).map_err(Failure::invalid)?;
                let reply = plugin.handle(event).map_err(Failure::handler)?;
                if reply != Reply::Ack {
                    ignored_reply(method, &reply);
                }
                Ok(Empty {}.encode_to_vec())
            }
        }
    }

    async fn send(&mut self, conn: ConnId, message: TtrpcMessage) -> StubResult<()> {
        let mut buf = BytesMut::new();
        TtrpcCodec
            .encode(message, &mut buf)
            .change_context(StubError::Codec {
                message: "Failed to encode ttrpc message".into(),
            })?;

        for frame in MuxFrame::chunked(conn, buf.freeze()) {
            self.framed
                .feed(frame)
                .await
                .change_context(StubError::Connection {
                    message: "Failed to write to runtime socket".into(),
                })?;
        }
        self.framed.flush().await.change_context(StubError::Connection {
            message: "Failed to flush runtime socket".into(),
        })
    }
}

fn decode_message(buf: &mut BytesMut) -> StubResult<Option<TtrpcMessage>> {
    TtrpcCodec.decode(buf).change_context(StubError::Protocol {
        message: "Invalid ttrpc frame".into(),
    })
}

fn check_registration(payload: Bytes) -> StubResult<()> {
    let response = Response::decode(payload).change_context(StubError::Registration {
        message: "undecodable RegisterPlugin reply".into(),
    })?;

    match response.status {
        Some(status) if status.code != StatusCode::Ok as i32 => {
            Err(Report::new(StubError::Registration {
                message: format!(
                    "runtime rejected plugin (code {}): {}",
                    status.code, status.message
                ),
            }))
        }
        _ => Ok(()),
    }
}

fn require<T>(value: Option<T>, method: Method, what: &str) -> Result<T, Failure> {
    value.ok_or_else(|| Failure::invalid(format!("{method} request without {what}")))
}

fn updates_of(method: Method, reply: Reply) -> Vec<ContainerUpdate> {
    match reply {
        Reply::Update(update) => update,
        Reply::Ack => Vec::new(),
        other => {
            ignored_reply(method, &other);
            Vec::new()
        }
    }
}

fn ignored_reply(method: Method, reply: &Reply) {
    warn!(%method, ?reply, "Ignoring plugin reply that does not apply to this request");
}

fn adopt_socket(fd: RawFd) -> StubResult<UnixStream> {
    // SAFETY: the descriptor comes from `NRI_PLUGIN_SOCKET` or `--socket-fd`
    // and must name a connected Unix socket that nothing else in this process
    // owns. Negative values are refused by `StubConfig::validate`.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream
        .set_nonblocking(true)
        .change_context(StubError::Connection {
            message: format!("Failed to make socket fd {fd} non-blocking"),
        })?;
    UnixStream::from_std(stream).change_context(StubError::Connection {
        message: format!("Failed to adopt socket fd {fd}"),
    })
}
