use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};

use crate::dispatch::correlator::{AwaitOutcome, ResponseCorrelator};
use crate::dispatch::queue::{Job, RequestQueue};
use crate::logging::{LogLevel, Logger};
use crate::processor::Processor;
use crate::registry::ConnectionRegistry;
use crate::server::PersistentConnection;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::ServerStats;
use crate::wire::codec::{decode_payload, encode_frame, CodecError, FrameAccumulator};
use crate::wire::envelope::{
    echo_request_id, error_reply, evaluate_request, health_reply, pong_reply, stats_reply,
    translation_timeout, ClientAction, TranslationRequest,
};

const LOG_CONTEXT: &str = "session";
const READ_BUFFER_SIZE: usize = 4096;

/// Everything a connection handler needs, shared across all sessions.
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<RequestQueue>,
    pub correlator: Arc<ResponseCorrelator>,
    pub processor: Arc<dyn Processor>,
    pub stats: Arc<ServerStats>,
    pub logger: Arc<Logger>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub dispatch_timeout: Duration,
    pub poll_interval: Duration,
    pub max_frame_size: usize,
}

/// Spawns the receive loop for one accepted connection. The session owns the
/// connection's registry entry from here until its loop ends. Requests on
/// one connection are handled one at a time, in arrival order.
pub fn spawn_session(
    context: Arc<SessionContext>,
    connection: Arc<PersistentConnection>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("session-{}", connection.id()))
        .spawn(move || run_session(&context, &connection))
        .expect("session thread spawn failed")
}

fn run_session(context: &SessionContext, connection: &Arc<PersistentConnection>) {
    let connection_id = context.registry.register(Arc::clone(connection));
    context.stats.connection_opened();
    context.logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "client connected",
        Some(json!({
            "connection_id": connection_id,
            "peer_addr": connection.peer_addr().to_string(),
        })),
    );

    receive_loop(context, connection, connection_id);

    let _ = context.registry.unregister(connection_id);
    context.stats.connection_closed();
    let _ = connection.shutdown();
    context.logger.info(
        Some(LOG_CONTEXT),
        &format!("client {connection_id} disconnected"),
    );
}

fn receive_loop(
    context: &SessionContext,
    connection: &PersistentConnection,
    connection_id: u64,
) {
    let mut accumulator = FrameAccumulator::new(context.max_frame_size);
    let mut buffer = [0_u8; READ_BUFFER_SIZE];

    loop {
        match connection.try_read(&mut buffer) {
            Ok(0) => return,
            Ok(count) => {
                accumulator.push_bytes(&buffer[..count]);
                if drain_frames(context, connection, connection_id, &mut accumulator).is_err() {
                    return;
                }
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => {
                if context.shutdown.stop_requested() {
                    return;
                }
                thread::sleep(context.poll_interval);
            }
            Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => {
                context.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("read failed for connection {connection_id}: {source}"),
                );
                return;
            }
        }
    }
}

/// Handles every complete frame currently buffered. An `Err` means the
/// connection is beyond recovery and must be dropped.
fn drain_frames(
    context: &SessionContext,
    connection: &PersistentConnection,
    connection_id: u64,
    accumulator: &mut FrameAccumulator,
) -> Result<(), ()> {
    loop {
        match accumulator.next_payload() {
            Ok(Some(payload)) => {
                handle_payload(context, connection, connection_id, &payload)?;
            }
            Ok(None) => return Ok(()),
            // A broken length header leaves no way to find the next frame
            // boundary, so the reply is a parting message.
            Err(error) => {
                let _ = send_reply(context, connection, &error_reply(None, &error.to_string()));
                context.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("dropping connection {connection_id}: {error}"),
                );
                return Err(());
            }
        }
    }
}

fn handle_payload(
    context: &SessionContext,
    connection: &PersistentConnection,
    connection_id: u64,
    payload: &[u8],
) -> Result<(), ()> {
    let raw = match decode_payload(payload) {
        Ok(raw) => raw,
        // Framing stayed intact, so a malformed document only fails this
        // one request.
        Err(error @ (CodecError::JsonDecode(_) | CodecError::EnvelopeMustBeObject)) => {
            context.stats.error_recorded();
            return send_reply(context, connection, &error_reply(None, &error.to_string()));
        }
        Err(error) => {
            let _ = send_reply(context, connection, &error_reply(None, &error.to_string()));
            return Err(());
        }
    };

    let action = match evaluate_request(&raw) {
        Ok(action) => action,
        Err(error) => {
            context.stats.error_recorded();
            let request_id = echo_request_id(&raw);
            return send_reply(
                context,
                connection,
                &error_reply(request_id.as_deref(), &error.to_string()),
            );
        }
    };

    let _ = context.registry.record_request(connection_id);

    match action {
        ClientAction::Translate(request) => {
            dispatch_translation(context, connection, connection_id, request)
        }
        ClientAction::Ping => send_reply(context, connection, &pong_reply()),
        ClientAction::Stats => send_reply(context, connection, &build_stats_reply(context)),
        ClientAction::Health => {
            let reply = health_reply(
                context.processor.health_report(),
                context.stats.active_connections(),
            );
            send_reply(context, connection, &reply)
        }
    }
}

fn dispatch_translation(
    context: &SessionContext,
    connection: &PersistentConnection,
    connection_id: u64,
    request: TranslationRequest,
) -> Result<(), ()> {
    context.stats.request_accepted();
    let request_id = request.request_id.clone();

    if !context.correlator.create_slot(&request_id) {
        context.stats.error_recorded();
        return send_reply(
            context,
            connection,
            &error_reply(
                Some(&request_id),
                &format!("request id '{request_id}' is already in flight"),
            ),
        );
    }

    context.queue.enqueue(Job::new(connection_id, request));

    let reply = match context
        .correlator
        .await_result(&request_id, context.dispatch_timeout)
    {
        AwaitOutcome::Fulfilled(reply) => reply,
        AwaitOutcome::TimedOut => {
            context.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "request timed out",
                Some(json!({
                    "connection_id": connection_id,
                    "request_id": request_id,
                    "timeout_ms": context.dispatch_timeout.as_millis() as u64,
                })),
            );
            translation_timeout(&request_id, context.dispatch_timeout.as_millis() as u64)
        }
    };

    send_reply(context, connection, &reply)
}

fn build_stats_reply(context: &SessionContext) -> Value {
    let mut server_stats = context.stats.snapshot();
    server_stats["queue_depth"] = Value::from(context.queue.len() as u64);
    server_stats["pending_requests"] = Value::from(context.correlator.pending_count() as u64);
    server_stats["connections"] = context.registry.snapshot();

    stats_reply(
        server_stats,
        context.processor.stats_payload(),
        context.processor.supported_languages(),
    )
}

fn send_reply(
    context: &SessionContext,
    connection: &PersistentConnection,
    reply: &Value,
) -> Result<(), ()> {
    let frame = match encode_frame(reply, context.max_frame_size) {
        Ok(frame) => frame,
        Err(error) => {
            context.logger.error(
                Some(LOG_CONTEXT),
                &format!("failed to encode reply: {error}"),
            );
            return Err(());
        }
    };

    connection.send_all(&frame).map_err(|source| {
        context.logger.warn(
            Some(LOG_CONTEXT),
            &format!("failed to send reply: {source}"),
        );
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::dispatch::correlator::ResponseCorrelator;
    use crate::dispatch::queue::RequestQueue;
    use crate::logging::{Logger, LoggerConfig};
    use crate::processor::{GlossaryProcessor, Processor, ProcessorError, Translation};
    use crate::registry::ConnectionRegistry;
    use crate::server::test_support::{accepted_pair, loopback_server};
    use crate::shutdown::ShutdownCoordinator;
    use crate::stats::ServerStats;
    use crate::wire::codec::{encode_frame, DEFAULT_MAX_FRAME_SIZE_BYTES};
    use crate::wire::envelope::TranslationRequest;
    use crate::workers::{WorkerPool, WorkerPoolConfig};

    use super::{spawn_session, SessionContext};

    struct SleepyProcessor {
        delay: Duration,
    }

    impl Processor for SleepyProcessor {
        fn process(&self, _request: &TranslationRequest) -> Result<Translation, ProcessorError> {
            thread::sleep(self.delay);
            Ok(Translation {
                text: "遅い".to_owned(),
                elapsed_ms: self.delay.as_millis() as u64,
            })
        }

        fn stats_payload(&self) -> Value {
            json!({})
        }

        fn health_report(&self) -> Value {
            json!({"healthy": true})
        }

        fn supported_languages(&self) -> Value {
            json!([])
        }

        fn release(&self) {}
    }

    struct Engine {
        context: Arc<SessionContext>,
        pool: WorkerPool,
    }

    fn engine(processor: Arc<dyn Processor>, dispatch_timeout: Duration) -> Engine {
        let queue = Arc::new(RequestQueue::new());
        let correlator = Arc::new(ResponseCorrelator::new());
        let stats = Arc::new(ServerStats::new());
        let logger = Arc::new(Logger::new(LoggerConfig::default()));

        let pool = WorkerPool::spawn(
            WorkerPoolConfig {
                count: 2,
                poll_interval: Duration::from_millis(10),
            },
            Arc::clone(&queue),
            Arc::clone(&correlator),
            Arc::clone(&processor),
            Arc::clone(&stats),
            Arc::clone(&logger),
        );

        let context = Arc::new(SessionContext {
            registry: Arc::new(ConnectionRegistry::new()),
            queue,
            correlator,
            processor,
            stats,
            logger,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            dispatch_timeout,
            poll_interval: Duration::from_millis(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE_BYTES,
        });

        Engine { context, pool }
    }

    fn send_request(client: &mut TcpStream, request: &Value) {
        let frame =
            encode_frame(request, DEFAULT_MAX_FRAME_SIZE_BYTES).expect("request should encode");
        client.write_all(&frame).expect("request should send");
    }

    fn read_reply(client: &mut TcpStream) -> Value {
        let mut header = [0_u8; 4];
        client
            .read_exact(&mut header)
            .expect("reply header should arrive");
        let length = u32::from_be_bytes(header) as usize;

        let mut payload = vec![0_u8; length];
        client
            .read_exact(&mut payload)
            .expect("reply payload should arrive");
        serde_json::from_slice(&payload).expect("reply should be JSON")
    }

    fn connected_session(engine: &Engine) -> TcpStream {
        let server = loopback_server();
        let (client, connection) = accepted_pair(&server);
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout should apply");
        spawn_session(Arc::clone(&engine.context), connection);
        client
    }

    fn shutdown(engine: Engine) {
        engine.pool.request_stop();
        engine.pool.join();
    }

    #[test]
    fn known_phrase_round_trips_with_success_status() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        send_request(
            &mut client,
            &json!({"type": "translation", "request_id": "r-1", "text": "Hello"}),
        );

        let reply = read_reply(&mut client);
        assert_eq!(reply["request_id"], "r-1");
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["translated_text"], "こんにちは");
        assert!(reply["processing_time_ms"].as_u64().is_some());

        shutdown(engine);
    }

    #[test]
    fn request_without_type_is_treated_as_translation() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        send_request(&mut client, &json!({"request_id": "r-2", "text": "Goodbye"}));

        let reply = read_reply(&mut client);
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["translated_text"], "さようなら");

        shutdown(engine);
    }

    #[test]
    fn missing_text_gets_error_reply_and_connection_survives() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        send_request(&mut client, &json!({"type": "translation", "request_id": "r-3"}));
        let error = read_reply(&mut client);
        assert_eq!(error["status"], "error");
        assert_eq!(error["request_id"], "r-3");
        assert!(error["error"]
            .as_str()
            .expect("error should be a string")
            .contains("text"));

        // Same connection must still serve the next request.
        send_request(
            &mut client,
            &json!({"type": "translation", "request_id": "r-4", "text": "Hello"}),
        );
        let reply = read_reply(&mut client);
        assert_eq!(reply["status"], "success");

        shutdown(engine);
    }

    #[test]
    fn malformed_json_gets_error_reply_without_closing() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        let garbage = b"{not json";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        frame.extend_from_slice(garbage);
        client.write_all(&frame).expect("frame should send");

        let error = read_reply(&mut client);
        assert_eq!(error["status"], "error");

        send_request(&mut client, &json!({"type": "ping"}));
        let pong = read_reply(&mut client);
        assert_eq!(pong["type"], "pong");

        shutdown(engine);
    }

    #[test]
    fn unknown_type_gets_error_reply_with_echoed_id() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        send_request(&mut client, &json!({"type": "transcribe", "request_id": "r-5"}));
        let error = read_reply(&mut client);
        assert_eq!(error["status"], "error");
        assert_eq!(error["request_id"], "r-5");

        shutdown(engine);
    }

    #[test]
    fn slow_processor_hits_the_timeout_boundary() {
        let engine = engine(
            Arc::new(SleepyProcessor {
                delay: Duration::from_millis(200),
            }),
            Duration::from_millis(10),
        );
        let mut client = connected_session(&engine);

        send_request(
            &mut client,
            &json!({"type": "translation", "request_id": "r-slow", "text": "Hello"}),
        );

        let reply = read_reply(&mut client);
        assert_eq!(reply["status"], "timeout");
        assert_eq!(reply["request_id"], "r-slow");
        assert_eq!(reply["error"], "request timed out after 10ms");

        thread::sleep(Duration::from_millis(250));
        shutdown(engine);
    }

    #[test]
    fn ping_stats_and_health_are_served_inline() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        send_request(&mut client, &json!({"type": "ping"}));
        let pong = read_reply(&mut client);
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["status"], "ok");

        send_request(
            &mut client,
            &json!({"type": "translation", "request_id": "r-6", "text": "Hello"}),
        );
        let _ = read_reply(&mut client);

        send_request(&mut client, &json!({"type": "stats"}));
        let stats = read_reply(&mut client);
        assert_eq!(stats["type"], "stats");
        assert_eq!(stats["server_stats"]["total_requests"], 1);
        assert_eq!(stats["processor_stats"]["total_processed"], 1);
        assert!(stats["server_stats"]["uptime_seconds"].as_f64().is_some());
        assert_eq!(stats["server_stats"]["connections"]["count"], 1);
        assert!(
            stats["server_stats"]["connections"]["connections"][0]["request_count"]
                .as_u64()
                .is_some()
        );

        send_request(&mut client, &json!({"type": "health"}));
        let health = read_reply(&mut client);
        assert_eq!(health["type"], "health");
        assert_eq!(health["server_status"], "running");
        assert_eq!(health["healthy"], true);
        assert_eq!(health["active_connections"], 1);

        shutdown(engine);
    }

    #[test]
    fn pipelined_requests_are_answered_in_order() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let mut client = connected_session(&engine);

        for (id, text) in [("r-a", "Hello"), ("r-b", "Goodbye"), ("r-c", "Thank you")] {
            send_request(
                &mut client,
                &json!({"type": "translation", "request_id": id, "text": text}),
            );
        }

        let first = read_reply(&mut client);
        let second = read_reply(&mut client);
        let third = read_reply(&mut client);
        assert_eq!(first["request_id"], "r-a");
        assert_eq!(second["request_id"], "r-b");
        assert_eq!(third["request_id"], "r-c");

        shutdown(engine);
    }

    #[test]
    fn session_unregisters_after_client_disconnect() {
        let engine = engine(Arc::new(GlossaryProcessor::new()), Duration::from_secs(2));
        let client = connected_session(&engine);

        for _ in 0..100 {
            if engine.context.registry.count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.context.registry.count(), 1);

        drop(client);

        for _ in 0..100 {
            if engine.context.registry.count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.context.registry.count(), 0);
        assert_eq!(engine.context.stats.active_connections(), 0);

        shutdown(engine);
    }
}
