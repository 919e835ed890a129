//! Shared test doubles
//!
//! Scripted stand-ins for the injectable seams: the prompt capability, the
//! platform keystore, and the transport. Everything here is deterministic so
//! tests can assert on exact call sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use tokio::sync::Barrier;
use zeroize::Zeroizing;

use crate::auth::{HardwareKeyStore, KeychainError, KeyMaterial};
use crate::error::{ConnectError, TransportError};
use crate::host::HostIdentity;
use crate::prompt::{InteractivePrompt, PromptHandler, PromptReply, PromptRequest};
use crate::transport::{
    AdvertisedMethods, InteractiveResponder, OperationsHandle, PingResult, SessionOperations,
    Transport, TransportFactory,
};
use crate::trust::HostKeyVerifier;

/// Fresh Ed25519 private key in OpenSSH PEM form
pub fn ed25519_key_pem() -> String {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    key.to_openssh(LineEnding::LF).unwrap().to_string()
}

/// Call at the top of a test to see log output with `--nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prompt handler that replays a scripted reply queue.
///
/// Replies are consumed in FIFO order no matter what kind of request comes
/// in; a request with no scripted reply left is a test bug and panics. Every
/// request is recorded for later inspection.
pub struct ScriptedPrompts {
    replies: Mutex<VecDeque<PromptReply>>,
    seen: Mutex<Vec<PromptRequest>>,
}

impl ScriptedPrompts {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn push(self, reply: PromptReply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<PromptRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl PromptHandler for ScriptedPrompts {
    async fn prompt(&self, request: PromptRequest) -> PromptReply {
        self.seen.lock().push(request.clone());
        match self.replies.lock().pop_front() {
            Some(reply) => reply,
            None => panic!("no scripted reply for prompt: {:?}", request),
        }
    }
}

/// In-memory stand-in for the platform keystore
pub struct MemoryHardwareStore {
    entries: RwLock<HashMap<String, String>>,
    retrievals: AtomicUsize,
}

impl MemoryHardwareStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retrievals: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, alias: &str, material: &str) {
        self.entries
            .write()
            .insert(alias.to_string(), material.to_string());
    }

    /// How many times `retrieve` was called
    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::Relaxed)
    }
}

impl HardwareKeyStore for MemoryHardwareStore {
    fn retrieve(&self, alias: &str) -> Result<Option<Zeroizing<String>>, KeychainError> {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .entries
            .read()
            .get(alias)
            .map(|material| Zeroizing::new(material.clone())))
    }
}

/// How a fake transport answers one keyboard-interactive exchange
pub enum KbiBehavior {
    /// Fail without sending a single prompt round
    RejectImmediately,
    /// One prompt round, then fail regardless of the answers
    PromptThenReject(Vec<InteractivePrompt>),
    /// One prompt round, succeed when the answers match
    PromptThenAccept {
        prompts: Vec<InteractivePrompt>,
        expected: Vec<String>,
    },
}

/// Transport double that records every method attempt.
///
/// Call strings: `none`, `advertised`, `publickey:<name>`, `kbi`,
/// `password`, `close`.
pub struct FakeTransport {
    authenticated: bool,
    accept_none_probe: bool,
    methods: AdvertisedMethods,
    accepted_key: Option<String>,
    accepted_password: Option<String>,
    kbi: VecDeque<KbiBehavior>,
    calls: Arc<Mutex<Vec<String>>>,
    close_counter: Option<Arc<AtomicUsize>>,
    operations_sink: Option<Arc<Mutex<Vec<Arc<FakeOperations>>>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            authenticated: false,
            accept_none_probe: false,
            methods: AdvertisedMethods::default(),
            accepted_key: None,
            accepted_password: None,
            kbi: VecDeque::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            close_counter: None,
            operations_sink: None,
        }
    }

    /// Server that requires no authentication at all
    pub fn accept_none(mut self) -> Self {
        self.accept_none_probe = true;
        self
    }

    pub fn advertise(mut self, methods: AdvertisedMethods) -> Self {
        self.methods = methods;
        self
    }

    /// Accept the public-key candidate with this credential name
    pub fn accept_key(mut self, name: &str) -> Self {
        self.accepted_key = Some(name.to_string());
        self
    }

    pub fn accept_password(mut self, password: &str) -> Self {
        self.accepted_password = Some(password.to_string());
        self
    }

    /// Queue the behavior for the next keyboard-interactive exchange
    pub fn push_kbi(mut self, behavior: KbiBehavior) -> Self {
        self.kbi.push_back(behavior);
        self
    }

    /// Everything attempted so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn advertised_methods(
        &mut self,
        _user: &str,
    ) -> Result<AdvertisedMethods, TransportError> {
        self.log("advertised");
        Ok(self.methods)
    }

    async fn authenticate_none(&mut self, _user: &str) -> Result<bool, TransportError> {
        self.log("none");
        if self.accept_none_probe {
            self.authenticated = true;
        }
        Ok(self.accept_none_probe)
    }

    async fn authenticate_public_key(
        &mut self,
        _user: &str,
        key: &KeyMaterial,
    ) -> Result<bool, TransportError> {
        self.log(format!("publickey:{}", key.name()));
        let accepted = self.accepted_key.as_deref() == Some(key.name());
        if accepted {
            self.authenticated = true;
        }
        Ok(accepted)
    }

    async fn authenticate_keyboard_interactive(
        &mut self,
        _user: &str,
        responder: &dyn InteractiveResponder,
    ) -> Result<bool, TransportError> {
        self.log("kbi");
        match self.kbi.pop_front().unwrap_or(KbiBehavior::RejectImmediately) {
            KbiBehavior::RejectImmediately => Ok(false),
            KbiBehavior::PromptThenReject(prompts) => {
                let _ = responder.respond("", "", &prompts).await;
                Ok(false)
            }
            KbiBehavior::PromptThenAccept { prompts, expected } => {
                match responder.respond("", "", &prompts).await {
                    Some(answers) if answers == expected => {
                        self.authenticated = true;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    async fn authenticate_password(
        &mut self,
        _user: &str,
        password: &str,
    ) -> Result<bool, TransportError> {
        self.log("password");
        let accepted = self.accepted_password.as_deref() == Some(password);
        if accepted {
            self.authenticated = true;
        }
        Ok(accepted)
    }

    async fn into_operations(self: Box<Self>) -> Result<OperationsHandle, TransportError> {
        if !self.authenticated {
            return Err(TransportError::Protocol(
                "connection is not authenticated".to_string(),
            ));
        }
        let operations = Arc::new(FakeOperations::new());
        if let Some(sink) = &self.operations_sink {
            sink.lock().push(operations.clone());
        }
        Ok(operations)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.log("close");
        if let Some(counter) = &self.close_counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Operations double backing fake sessions
pub struct FakeOperations {
    connected: AtomicBool,
    closes: AtomicUsize,
}

impl FakeOperations {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        }
    }

    /// Simulate the link dropping out from under the session
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// How many times `close` was called
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionOperations for FakeOperations {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> PingResult {
        if self.is_connected() {
            PingResult::Ok
        } else {
            PingResult::IoError
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`FakeTransport`]s, with hooks for the registry tests.
///
/// By default every produced transport accepts the `none` probe, so a
/// connect needs no prompts at all.
pub struct FakeTransportFactory {
    reject_auth: bool,
    host_key: Option<(String, Vec<u8>)>,
    barrier: Option<Arc<Barrier>>,
    connects: AtomicUsize,
    transport_closes: Arc<AtomicUsize>,
    operations: Arc<Mutex<Vec<Arc<FakeOperations>>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self {
            reject_auth: false,
            host_key: None,
            barrier: None,
            connects: AtomicUsize::new(0),
            transport_closes: Arc::new(AtomicUsize::new(0)),
            operations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Produce transports that advertise no methods and accept nothing
    pub fn reject_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    /// Present this host key through the verifier during connect
    pub fn with_host_key(mut self, algorithm: &str, key: &[u8]) -> Self {
        self.host_key = Some((algorithm.to_string(), key.to_vec()));
        self
    }

    /// Make every connect rendezvous at the barrier before returning
    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// How many times `connect` was called
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// How many produced transports were closed before conversion
    pub fn transport_closes(&self) -> usize {
        self.transport_closes.load(Ordering::SeqCst)
    }

    /// Every operations handle produced so far, in creation order
    pub fn operations(&self) -> Vec<Arc<FakeOperations>> {
        self.operations.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(
        &self,
        identity: &HostIdentity,
        verifier: HostKeyVerifier,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if let Some((algorithm, key)) = &self.host_key {
            let verification = verifier.verify(identity, algorithm, key).await;
            if !verification.accepted {
                return Err(ConnectError::HostKeyRejected {
                    host: identity.address(),
                });
            }
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }

        let mut transport = FakeTransport::new();
        if !self.reject_auth {
            transport = transport.accept_none();
        }
        transport.close_counter = Some(self.transport_closes.clone());
        transport.operations_sink = Some(self.operations.clone());
        Ok(Box::new(transport))
    }
}
