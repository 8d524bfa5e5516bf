//! In-process media engine.
//!
//! Implements the engine traits without forwarding any media. Object
//! lifetimes mirror a real routing engine: every object owns a
//! [`CancellationToken`] derived from its parent's, so closing a worker,
//! router, transport or producer closes everything created beneath it.
//!
//! ```text
//! worker token
//! └── router token
//!     └── transport token
//!         ├── producer token ─┐
//!         └── consumer token ◀┘ (also closed when its producer closes)
//! ```

use super::{
    ConsumerLayers, ConsumerType, DtlsParameters, EngineConsumer, EngineError, EngineProducer,
    EngineRouter, EngineTransport, EngineWorker, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportParams, WebRtcTransportOptions,
};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// First dynamic payload type handed out in router capabilities.
const FIRST_PAYLOAD_TYPE: u8 = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure switches shared by every object of one [`LocalEngine`].
///
/// Tests flip these to exercise the error and compensation paths.
#[derive(Debug, Default)]
pub struct EngineFaults {
    pub fail_create_router: AtomicBool,
    pub fail_create_transport: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_produce: AtomicBool,
    pub fail_consume: AtomicBool,
    pub fail_resume: AtomicBool,
    pub fail_set_bitrate: AtomicBool,
}

impl EngineFaults {
    fn check(flag: &AtomicBool, operation: &str) -> Result<(), EngineError> {
        if flag.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected(format!("{operation} failed (injected)")));
        }
        Ok(())
    }
}

/// Port pool for transports. Ports are returned when a transport closes.
#[derive(Debug)]
struct PortAllocator {
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            free: Mutex::new((min_port..=max_port).collect()),
        }
    }

    fn allocate(&self) -> Result<u16, EngineError> {
        lock(&self.free).pop_first().ok_or(EngineError::PortsExhausted)
    }

    fn release(&self, port: u16) {
        lock(&self.free).insert(port);
    }

    fn available(&self) -> usize {
        lock(&self.free).len()
    }
}

/// Factory for in-process workers sharing one port range.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    ports: Arc<PortAllocator>,
    faults: Arc<EngineFaults>,
    next_pid: Arc<AtomicU32>,
}

impl LocalEngine {
    /// Create an engine allocating transport ports from `min_port..=max_port`.
    #[must_use]
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            ports: Arc::new(PortAllocator::new(min_port, max_port)),
            faults: Arc::new(EngineFaults::default()),
            next_pid: Arc::new(AtomicU32::new(std::process::id().saturating_add(1))),
        }
    }

    /// Fault injection switches.
    #[must_use]
    pub fn faults(&self) -> &EngineFaults {
        &self.faults
    }

    /// Number of transport ports currently free.
    #[must_use]
    pub fn free_ports(&self) -> usize {
        self.ports.available()
    }

    /// Start one worker.
    #[must_use]
    pub fn spawn_worker(&self) -> Arc<LocalWorker> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(LocalWorker {
            id: format!("worker-{pid}"),
            pid,
            token: CancellationToken::new(),
            death_reason: Mutex::new(None),
            ports: Arc::clone(&self.ports),
            faults: Arc::clone(&self.faults),
        });
        debug!(target: "sc.engine", worker_id = %worker.id, pid, "Worker started");
        worker
    }
}

/// One in-process worker.
#[derive(Debug)]
pub struct LocalWorker {
    id: String,
    pid: u32,
    token: CancellationToken,
    death_reason: Mutex<Option<String>>,
    ports: Arc<PortAllocator>,
    faults: Arc<EngineFaults>,
}

impl LocalWorker {
    /// Simulate the worker process dying. Every router on it is closed.
    pub fn kill(&self, reason: &str) {
        {
            let mut slot = lock(&self.death_reason);
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        warn!(target: "sc.engine", worker_id = %self.id, reason, "Worker died");
        self.token.cancel();
    }
}

#[async_trait]
impl EngineWorker for LocalWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn EngineRouter>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::WorkerDied(self.id.clone()));
        }
        EngineFaults::check(&self.faults.fail_create_router, "createRouter")?;
        if media_codecs.is_empty() {
            return Err(EngineError::Rejected("no media codecs".to_string()));
        }

        let router = LocalRouter {
            id: Uuid::new_v4().to_string(),
            token: self.token.child_token(),
            codecs: assign_payload_types(media_codecs),
            producers: Arc::new(Mutex::new(HashMap::new())),
            ports: Arc::clone(&self.ports),
            faults: Arc::clone(&self.faults),
        };
        debug!(target: "sc.engine", worker_id = %self.id, router_id = %router.id, "Router created");
        Ok(Arc::new(router))
    }

    async fn died(&self) -> String {
        self.token.cancelled().await;
        lock(&self.death_reason)
            .clone()
            .unwrap_or_else(|| "worker closed".to_string())
    }
}

fn assign_payload_types(media_codecs: &[RtpCodecCapability]) -> Vec<Value> {
    media_codecs
        .iter()
        .zip(FIRST_PAYLOAD_TYPE..)
        .map(|(codec, payload_type)| {
            let mut entry = json!({
                "kind": codec.kind,
                "mimeType": codec.mime_type,
                "clockRate": codec.clock_rate,
                "preferredPayloadType": payload_type,
                "parameters": codec.parameters,
                "rtcpFeedback": [],
            });
            if let (Some(channels), Some(obj)) = (codec.channels, entry.as_object_mut()) {
                obj.insert("channels".to_string(), json!(channels));
            }
            entry
        })
        .collect()
}

/// Producer bookkeeping kept on the router for `can_consume` and `consume`.
#[derive(Debug, Clone)]
struct ProducerEntry {
    kind: MediaKind,
    encodings: usize,
    token: CancellationToken,
}

type ProducerTable = Arc<Mutex<HashMap<String, ProducerEntry>>>;

#[derive(Debug)]
struct LocalRouter {
    id: String,
    token: CancellationToken,
    codecs: Vec<Value>,
    producers: ProducerTable,
    ports: Arc<PortAllocator>,
    faults: Arc<EngineFaults>,
}

/// First router codec of `kind`.
fn codec_for_kind(codecs: &[Value], kind: MediaKind) -> Option<&Value> {
    codecs
        .iter()
        .find(|c| c.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
}

fn capabilities_cover_kind(rtp_capabilities: &RtpCapabilities, kind: MediaKind) -> bool {
    rtp_capabilities
        .0
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs.iter().any(|codec| {
                codec.get("kind").and_then(Value::as_str) == Some(kind.as_str())
                    || codec
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .is_some_and(|mime| mime.starts_with(&format!("{kind}/")))
            })
        })
}

#[async_trait]
impl EngineRouter for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": self.codecs,
            "headerExtensions": [],
        }))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let kind = match lock(&self.producers).get(producer_id) {
            Some(entry) if !entry.token.is_cancelled() => entry.kind,
            _ => return false,
        };
        capabilities_cover_kind(rtp_capabilities, kind)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        EngineFaults::check(&self.faults.fail_create_transport, "createWebRtcTransport")?;
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Rejected(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        let port = self.ports.allocate()?;
        let token = self.token.child_token();

        let ports = Arc::clone(&self.ports);
        let release_token = token.clone();
        tokio::spawn(async move {
            release_token.cancelled().await;
            ports.release(port);
        });

        let id = Uuid::new_v4().to_string();
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": random_token(16),
                "password": random_token(32),
                "iceLite": true,
            }),
            ice_candidates: ice_candidates(options, port),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": random_fingerprint() }],
            }),
        };

        debug!(
            target: "sc.engine",
            router_id = %self.id,
            transport_id = %id,
            port,
            "WebRTC transport created"
        );

        Ok(Arc::new(LocalTransport {
            id,
            params,
            token,
            connected: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
            router_codecs: self.codecs.clone(),
            producers: Arc::clone(&self.producers),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn close(&self) {
        if !self.token.is_cancelled() {
            debug!(target: "sc.engine", router_id = %self.id, "Router closed");
        }
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill(bytes.as_mut_slice());
    let mut token = hex::encode(bytes);
    token.truncate(len);
    token
}

fn random_fingerprint() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

fn ice_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<Value> {
    let address = options
        .announced_ip
        .clone()
        .unwrap_or_else(|| options.listen_ip.to_string());
    let mut candidates = Vec::new();
    if options.enable_udp {
        candidates.push(json!({
            "foundation": "udpcandidate",
            "priority": if options.prefer_udp { 1_076_302_079_u32 } else { 1_076_302_078_u32 },
            "address": address,
            "protocol": "udp",
            "port": port,
            "type": "host",
        }));
    }
    if options.enable_tcp {
        candidates.push(json!({
            "foundation": "tcpcandidate",
            "priority": if options.prefer_udp { 1_076_276_479_u32 } else { 1_076_302_079_u32 },
            "address": address,
            "protocol": "tcp",
            "port": port,
            "type": "host",
            "tcpType": "passive",
        }));
    }
    candidates
}

fn validate_dtls(dtls_parameters: &DtlsParameters) -> Result<(), EngineError> {
    let fingerprints = dtls_parameters
        .0
        .get("fingerprints")
        .and_then(Value::as_array)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| EngineError::Rejected("missing DTLS fingerprints".to_string()))?;
    for fingerprint in fingerprints {
        let algorithm = fingerprint.get("algorithm").and_then(Value::as_str);
        let value = fingerprint.get("value").and_then(Value::as_str);
        if algorithm.is_none() || value.is_none() {
            return Err(EngineError::Rejected("malformed DTLS fingerprint".to_string()));
        }
    }
    if let Some(role) = dtls_parameters.0.get("role").and_then(Value::as_str) {
        if !matches!(role, "auto" | "client" | "server") {
            return Err(EngineError::Rejected(format!("invalid DTLS role {role}")));
        }
    }
    Ok(())
}

/// Validates producer RTP parameters against the router codecs and returns
/// the number of encodings.
fn validate_rtp(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_codecs: &[Value],
) -> Result<usize, EngineError> {
    let codecs = rtp_parameters
        .0
        .get("codecs")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| EngineError::Rejected("missing RTP codecs".to_string()))?;

    let prefix = format!("{kind}/");
    let supported = codecs.iter().any(|codec| {
        let Some(mime) = codec.get("mimeType").and_then(Value::as_str) else {
            return false;
        };
        mime.to_ascii_lowercase().starts_with(&prefix)
            && router_codecs.iter().any(|rc| {
                rc.get("mimeType")
                    .and_then(Value::as_str)
                    .is_some_and(|r| r.eq_ignore_ascii_case(mime))
            })
    });
    if !supported {
        return Err(EngineError::Rejected(format!(
            "no {kind} codec supported by the router"
        )));
    }

    let encodings = rtp_parameters
        .0
        .get("encodings")
        .and_then(Value::as_array)
        .map_or(1, |e| e.len().max(1));
    Ok(encodings)
}

#[derive(Debug)]
struct LocalTransport {
    id: String,
    params: TransportParams,
    token: CancellationToken,
    connected: AtomicBool,
    max_incoming_bitrate: AtomicU32,
    router_codecs: Vec<Value>,
    producers: ProducerTable,
    faults: Arc<EngineFaults>,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: &DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        EngineFaults::check(&self.faults.fail_connect, "connect")?;
        validate_dtls(dtls_parameters)?;
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        debug!(target: "sc.engine", transport_id = %self.id, "Transport connected");
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        self.ensure_open()?;
        EngineFaults::check(&self.faults.fail_set_bitrate, "setMaxIncomingBitrate")?;
        self.max_incoming_bitrate.store(bitrate, Ordering::Relaxed);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        EngineFaults::check(&self.faults.fail_produce, "produce")?;
        let encodings = validate_rtp(kind, rtp_parameters, &self.router_codecs)?;

        let id = Uuid::new_v4().to_string();
        let token = self.token.child_token();
        lock(&self.producers).insert(
            id.clone(),
            ProducerEntry {
                kind,
                encodings,
                token: token.clone(),
            },
        );

        let producers = Arc::clone(&self.producers);
        let watch_token = token.clone();
        let watch_id = id.clone();
        tokio::spawn(async move {
            watch_token.cancelled().await;
            lock(&producers).remove(&watch_id);
        });

        debug!(
            target: "sc.engine",
            transport_id = %self.id,
            producer_id = %id,
            kind = %kind,
            encodings,
            "Producer created"
        );

        Ok(Arc::new(LocalProducer {
            id,
            kind,
            token,
            paused: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        EngineFaults::check(&self.faults.fail_consume, "consume")?;

        let producer = lock(&self.producers)
            .get(producer_id)
            .filter(|p| !p.token.is_cancelled())
            .cloned()
            .ok_or_else(|| EngineError::CannotConsume(producer_id.to_string()))?;
        if !capabilities_cover_kind(rtp_capabilities, producer.kind) {
            return Err(EngineError::CannotConsume(producer_id.to_string()));
        }

        let codec = codec_for_kind(&self.router_codecs, producer.kind)
            .cloned()
            .ok_or_else(|| EngineError::CannotConsume(producer_id.to_string()))?;

        let consumer_type = if producer.encodings > 1 {
            ConsumerType::Simulcast
        } else {
            ConsumerType::Simple
        };

        let id = Uuid::new_v4().to_string();
        let token = self.token.child_token();

        // A consumer dies with its producer as well as with its transport.
        let producer_token = producer.token.clone();
        let consumer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = producer_token.cancelled() => consumer_token.cancel(),
                () = consumer_token.cancelled() => {}
            }
        });

        let ssrc: u32 = rand::thread_rng().gen();
        let rtp_parameters = json!({
            "mid": id.get(..8).unwrap_or(&id),
            "codecs": [codec],
            "encodings": [{ "ssrc": ssrc }],
            "headerExtensions": [],
            "rtcp": { "cname": random_token(16), "reducedSize": true },
        });

        debug!(
            target: "sc.engine",
            transport_id = %self.id,
            consumer_id = %id,
            producer_id = %producer_id,
            consumer_type = ?consumer_type,
            "Consumer created"
        );

        Ok(Arc::new(LocalConsumer {
            id,
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters,
            consumer_type,
            paused: AtomicBool::new(paused),
            preferred_layers: Mutex::new(None),
            token,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug)]
struct LocalProducer {
    id: String,
    kind: MediaKind,
    token: CancellationToken,
    paused: AtomicBool,
}

impl EngineProducer for LocalProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    token: CancellationToken,
    faults: Arc<EngineFaults>,
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn producer_paused(&self) -> bool {
        false
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        if !self.consumer_type.is_layered() {
            return Err(EngineError::Rejected(
                "preferred layers need a layered consumer".to_string(),
            ));
        }
        *lock(&self.preferred_layers) = Some(layers);
        Ok(())
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *lock(&self.preferred_layers)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        EngineFaults::check(&self.faults.fail_resume, "resume")?;
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::{media_codecs, HIGHEST_LAYERS};
    use std::time::Duration;

    fn dtls() -> DtlsParameters {
        DtlsParameters(json!({
            "role": "client",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }],
        }))
    }

    fn video_rtp(encodings: usize) -> RtpParameters {
        let encodings: Vec<Value> = (0..encodings)
            .map(|i| json!({ "rid": format!("r{i}") }))
            .collect();
        RtpParameters(json!({
            "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000, "payloadType": 101 }],
            "encodings": encodings,
        }))
    }

    fn client_caps() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
            ]
        }))
    }

    async fn router(engine: &LocalEngine) -> (Arc<LocalWorker>, Arc<dyn EngineRouter>) {
        let worker = engine.spawn_worker();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        (worker, router)
    }

    /// Yield so spawned watcher tasks observe cancellation.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_router_capabilities_carry_codecs() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;

        let caps = router.rtp_capabilities();
        let codecs = caps.0["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0]["preferredPayloadType"], 100);
        assert_eq!(codecs[0]["channels"], 2);
        assert!(codecs[1].get("channels").is_none());
    }

    #[tokio::test]
    async fn test_transport_params_and_port_release() {
        let engine = LocalEngine::new(40000, 40001);
        let (_worker, router) = router(&engine).await;
        let options = WebRtcTransportOptions::default();

        let t1 = router.create_webrtc_transport(&options).await.unwrap();
        let params = t1.params();
        assert_eq!(params.id, t1.id());
        assert_eq!(params.ice_candidates.len(), 2);
        assert_eq!(params.ice_candidates[0]["port"], 40000);
        assert_eq!(params.ice_parameters["usernameFragment"].as_str().unwrap().len(), 16);
        assert_eq!(engine.free_ports(), 1);

        let _t2 = router.create_webrtc_transport(&options).await.unwrap();
        let err = router.create_webrtc_transport(&options).await;
        assert!(matches!(err, Err(EngineError::PortsExhausted)));

        t1.close();
        settle().await;
        assert_eq!(engine.free_ports(), 1);
    }

    #[tokio::test]
    async fn test_announced_ip_used_in_candidates() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let options = WebRtcTransportOptions {
            announced_ip: Some("203.0.113.7".to_string()),
            enable_tcp: false,
            ..WebRtcTransportOptions::default()
        };

        let transport = router.create_webrtc_transport(&options).await.unwrap();
        let candidates = transport.params().ice_candidates;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0]["address"], "203.0.113.7");
    }

    #[tokio::test]
    async fn test_connect_validates_dtls_and_rejects_second_call() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();

        let bad = DtlsParameters(json!({ "fingerprints": [] }));
        assert!(matches!(
            transport.connect(&bad).await,
            Err(EngineError::Rejected(_))
        ));

        transport.connect(&dtls()).await.unwrap();
        assert!(transport.connect(&dtls()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_rejects_mismatched_kind() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();

        let result = transport.produce(MediaKind::Audio, &video_rtp(1)).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));

        let producer = transport.produce(MediaKind::Video, &video_rtp(1)).await.unwrap();
        assert_eq!(producer.kind(), MediaKind::Video);
        assert!(router.can_consume(producer.id(), &client_caps()));
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_codec() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport.produce(MediaKind::Video, &video_rtp(1)).await.unwrap();

        let audio_only = RtpCapabilities(json!({
            "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 }]
        }));
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(!router.can_consume("missing", &client_caps()));
    }

    #[tokio::test]
    async fn test_consumer_uses_router_codec_of_producer_kind() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let send = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = send.produce(MediaKind::Video, &video_rtp(1)).await.unwrap();

        let consumer = recv.consume(producer.id(), &client_caps(), false).await.unwrap();
        let rtp = consumer.rtp_parameters();
        let codecs = rtp["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0]["mimeType"], "video/VP8");

        let router_caps = router.rtp_capabilities();
        let router_codecs = router_caps.0["codecs"].as_array().unwrap();
        assert_eq!(
            codec_for_kind(router_codecs, MediaKind::Audio).unwrap()["mimeType"],
            "audio/opus"
        );
        assert_eq!(codecs[0], *codec_for_kind(router_codecs, MediaKind::Video).unwrap());
    }

    #[tokio::test]
    async fn test_simulcast_consumer_and_layers() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let send = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();

        let simple = send.produce(MediaKind::Video, &video_rtp(1)).await.unwrap();
        let layered = send.produce(MediaKind::Video, &video_rtp(3)).await.unwrap();

        let c1 = recv.consume(simple.id(), &client_caps(), false).await.unwrap();
        assert_eq!(c1.consumer_type(), ConsumerType::Simple);
        assert!(c1.set_preferred_layers(HIGHEST_LAYERS).await.is_err());

        let c2 = recv.consume(layered.id(), &client_caps(), true).await.unwrap();
        assert_eq!(c2.consumer_type(), ConsumerType::Simulcast);
        assert!(c2.paused());
        c2.set_preferred_layers(HIGHEST_LAYERS).await.unwrap();
        assert_eq!(c2.preferred_layers(), Some(HIGHEST_LAYERS));
        c2.resume().await.unwrap();
        assert!(!c2.paused());
    }

    #[tokio::test]
    async fn test_close_cascades() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let send = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = send.produce(MediaKind::Video, &video_rtp(1)).await.unwrap();
        let consumer = recv.consume(producer.id(), &client_caps(), false).await.unwrap();

        // Closing the send transport closes its producer and the remote consumer.
        send.close();
        settle().await;
        assert!(producer.is_closed());
        assert!(consumer.is_closed());
        assert!(!recv.is_closed());
        assert!(!router.can_consume(producer.id(), &client_caps()));

        let result = recv.consume(producer.id(), &client_caps(), false).await;
        assert!(matches!(result, Err(EngineError::CannotConsume(_))));
    }

    #[tokio::test]
    async fn test_transport_closed_future_resolves() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap();

        let watcher = Arc::clone(&transport);
        let handle = tokio::spawn(async move { watcher.closed().await });

        router.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("closed() should resolve")
            .unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_worker_kill_resolves_died_and_closes_routers() {
        let engine = LocalEngine::new(40000, 40010);
        let (worker, router) = router(&engine).await;

        let w = Arc::clone(&worker);
        let died = tokio::spawn(async move { w.died().await });

        worker.kill("segfault");
        let reason = tokio::time::timeout(Duration::from_secs(1), died)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "segfault");
        assert!(!worker.is_alive());
        assert!(router.is_closed());
        assert!(matches!(
            worker.create_router(&media_codecs()).await,
            Err(EngineError::WorkerDied(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let engine = LocalEngine::new(40000, 40010);
        let (_worker, router) = router(&engine).await;

        engine
            .faults()
            .fail_create_transport
            .store(true, Ordering::SeqCst);
        let result = router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
        assert_eq!(engine.free_ports(), 11, "no port leaked on failure");
    }

    #[test]
    fn test_random_fingerprint_format() {
        let fp = random_fingerprint();
        assert_eq!(fp.split(':').count(), 32);
        assert!(fp.chars().all(|c| c == ':' || c.is_ascii_hexdigit()));
    }
}
