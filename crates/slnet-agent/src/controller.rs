use std::{net::IpAddr, path::PathBuf};

use slnet_process::{ConsoleEvent, ProcessStats, ServerEvent, ServerState, StatusSnapshot};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};

use crate::{
    config::{AgentConfig, PersistedConfig, save_persisted},
    console,
    crash::write_crash_report,
    error::{NatAction, SupervisorError},
    nat_gateway::PortMapper,
    port_probe::is_port_available,
    process_supervisor::{LaunchSpec, Launcher, ServerSession, SessionOutput},
    roster::PlayerRoster,
    stats::ResourceSampler,
    support::{format_error_chain, unix_ms},
};

#[derive(Debug)]
pub enum ControlRequest {
    Start,
    Stop,
    SendInput(String),
    ChangeDirectory(PathBuf),
    AcknowledgeFatal,
    ExternalIp(oneshot::Sender<Result<IpAddr, String>>),
    Shutdown,
}

/// Everything the controller needs, built once by `main`.
pub struct AgentContext<G, L> {
    pub config: AgentConfig,
    pub gateway: G,
    pub launcher: L,
    pub events: broadcast::Sender<ServerEvent>,
    pub status: watch::Sender<StatusSnapshot>,
}

enum Wake {
    Request(Option<ControlRequest>),
    Output(Option<SessionOutput>),
    Tick,
}

/// Owns the server lifecycle: NAT mapping, the child process, and the
/// Offline/Starting/Online/Idle state machine driven by console output.
///
/// Runs as a single task; all state below is touched only from [`run`].
///
/// [`run`]: LifecycleController::run
pub struct LifecycleController<G, L> {
    ctx: AgentContext<G, L>,
    state: ServerState,
    session: Option<ServerSession>,
    mapped: bool,
    roster: PlayerRoster,
    sampler: ResourceSampler,
    started_at_unix_ms: Option<u64>,
    game_version: Option<String>,
    last_stats: Option<ProcessStats>,
}

impl<G: PortMapper, L: Launcher> LifecycleController<G, L> {
    pub fn new(ctx: AgentContext<G, L>) -> Self {
        Self {
            ctx,
            state: ServerState::Offline,
            session: None,
            mapped: false,
            roster: PlayerRoster::default(),
            sampler: ResourceSampler::default(),
            started_at_unix_ms: None,
            game_version: None,
            last_stats: None,
        }
    }

    /// Serves requests until shutdown. Returns an error only when NAT
    /// traversal is exhausted; the caller is expected to exit the process.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
    ) -> Result<(), SupervisorError> {
        self.publish_status();

        let mut ticker = tokio::time::interval(self.ctx.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                req = requests.recv() => Wake::Request(req),
                out = next_output(&mut self.session) => Wake::Output(out),
                _ = ticker.tick() => Wake::Tick,
            };

            let outcome = match wake {
                Wake::Request(None) | Wake::Request(Some(ControlRequest::Shutdown)) => {
                    tracing::info!("controller shutting down");
                    let stopped = self.stop().await;
                    if let Err(err) = &stopped {
                        // Nobody is left to acknowledge; report and exit.
                        self.report_fatal(err).await;
                    }
                    return stopped;
                }
                Wake::Request(Some(req)) => self.handle(req).await,
                Wake::Output(out) => self.on_output(out).await,
                Wake::Tick => {
                    self.sample_stats().await;
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                return Err(self.escalate(err, &mut requests).await);
            }
        }
    }

    async fn handle(&mut self, req: ControlRequest) -> Result<(), SupervisorError> {
        match req {
            ControlRequest::Start => self.start().await,
            ControlRequest::Stop => self.stop().await,
            ControlRequest::SendInput(text) => {
                self.send_input(&text);
                Ok(())
            }
            ControlRequest::ChangeDirectory(path) => {
                self.change_directory(path).await;
                Ok(())
            }
            ControlRequest::AcknowledgeFatal => {
                tracing::debug!("fatal acknowledgement with no pending failure");
                Ok(())
            }
            ControlRequest::ExternalIp(reply) => {
                let res = self
                    .ctx
                    .gateway
                    .external_ip()
                    .await
                    .map_err(|e| e.to_string());
                let _ = reply.send(res);
                Ok(())
            }
            ControlRequest::Shutdown => Ok(()),
        }
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.session.is_some() || self.state != ServerState::Offline {
            tracing::debug!(state = %self.state, "start ignored; server already running");
            return Ok(());
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "server start failed");
                self.emit(ServerEvent::error(err.to_string()));
                self.set_state(ServerState::Offline);
                Ok(())
            }
        }
    }

    async fn start_inner(&mut self) -> Result<(), SupervisorError> {
        let config = &self.ctx.config;
        let (Some(server_dir), Some(executable)) =
            (config.server_dir.clone(), config.executable_path())
        else {
            return Err(SupervisorError::NotConfigured);
        };
        if !executable.is_file() {
            return Err(SupervisorError::ExecutableMissing(executable));
        }
        let port = config.port;

        self.set_state(ServerState::Starting);

        if !is_port_available(port) {
            tracing::warn!(port, "port in use; forcing cleanup before retry");
            self.emit(ServerEvent::log(format!(
                "Port {port} is in use. Cleaning up and retrying..."
            )));
            self.force_release(port).await;
            tokio::time::sleep(self.ctx.config.port_retry_delay).await;
            if !is_port_available(port) {
                return Err(SupervisorError::PortInUse(port));
            }
        }

        self.nat_with_retry(NatAction::Open, port).await?;
        self.mapped = true;
        self.emit(ServerEvent::log(format!(
            "UPnP successful. Port {port} opened successfully!"
        )));

        let spec = LaunchSpec {
            executable,
            working_dir: server_dir,
            args: self.ctx.config.launch_args(),
            env: vec![("FORCE_COLOR".to_string(), "1".to_string())],
        };
        match self.ctx.launcher.spawn(&spec) {
            Ok(session) => {
                tracing::info!(session = %session.id().0, port, "server session started");
                self.sampler.reset();
                self.session = Some(session);
                self.publish_status();
                Ok(())
            }
            Err(err) => {
                self.unmap().await?;
                Err(err)
            }
        }
    }

    /// Best-effort release before retrying an occupied port. A failed close here
    /// is not fatal; the mapping may simply not exist.
    async fn force_release(&mut self, port: u16) {
        if let Some(session) = self.session.take() {
            self.finish_session(session).await;
        }
        if let Err(e) = self.ctx.gateway.close(port).await {
            tracing::warn!(port, error = %e, "forced unmap failed");
        }
        self.mapped = false;
    }

    async fn nat_with_retry(&self, action: NatAction, port: u16) -> Result<(), SupervisorError> {
        let policy = self.ctx.config.nat_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = match action {
                NatAction::Open => self.ctx.gateway.open(port).await,
                NatAction::Close => self.ctx.gateway.close(port).await,
            };
            match res {
                Ok(()) => return Ok(()),
                Err(last) if attempt >= policy.max_attempts => {
                    return Err(SupervisorError::GatewayExhausted {
                        action,
                        port,
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    tracing::warn!(%action, port, attempt, error = %e, "UPnP request failed; retrying");
                    self.emit(ServerEvent::log(format!(
                        "UPnP {action} of port {port} failed (attempt {attempt}/{}): {e}. Retrying...",
                        policy.max_attempts
                    )));
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    async fn unmap(&mut self) -> Result<(), SupervisorError> {
        if !self.mapped {
            return Ok(());
        }
        let port = self.ctx.config.port;
        self.nat_with_retry(NatAction::Close, port).await?;
        self.mapped = false;
        self.emit(ServerEvent::log(format!("Port {port} closed.")));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        if self.session.is_none() && !self.mapped {
            tracing::debug!("stop ignored; nothing running");
            self.set_state(ServerState::Offline);
            return Ok(());
        }

        let unmapped = self.unmap().await;
        match self.session.take() {
            Some(session) => self.finish_session(session).await,
            None => self.set_state(ServerState::Offline),
        }
        unmapped
    }

    /// Kills the session and waits for its exit so the exit is reported once.
    async fn finish_session(&mut self, mut session: ServerSession) {
        session.kill();

        let deadline = Instant::now() + self.ctx.config.stop_drain_timeout;
        let code = loop {
            match tokio::time::timeout_at(deadline, session.next_output()).await {
                Ok(Some(SessionOutput::Stdout(line))) => self.emit(ServerEvent::log(line)),
                Ok(Some(SessionOutput::Stderr(line))) => {
                    self.emit(ServerEvent::log(format!("Error: {line}")))
                }
                Ok(Some(SessionOutput::Exited(code))) => break code,
                Ok(None) => break None,
                Err(_) => {
                    tracing::warn!("server did not report exit in time after kill");
                    break None;
                }
            }
        };
        self.on_exit(code);
    }

    async fn on_output(&mut self, out: Option<SessionOutput>) -> Result<(), SupervisorError> {
        match out {
            Some(SessionOutput::Stdout(line)) => {
                self.on_line(line);
                Ok(())
            }
            Some(SessionOutput::Stderr(line)) => self.on_stderr(line).await,
            Some(SessionOutput::Exited(code)) => {
                self.session = None;
                self.on_exit(code);
                Ok(())
            }
            None => {
                self.session = None;
                self.on_exit(None);
                Ok(())
            }
        }
    }

    async fn on_stderr(&mut self, line: String) -> Result<(), SupervisorError> {
        let crashed = line.contains("unhandled exception");
        self.emit(ServerEvent::log(format!("Error: {line}")));
        if crashed {
            tracing::error!(%line, "server reported an unhandled exception; stopping");
            return self.stop().await;
        }
        Ok(())
    }

    fn on_line(&mut self, line: String) {
        if self.roster.on_line(&line) {
            self.emit(ServerEvent::Players {
                players: self.roster.snapshot(),
            });
            self.publish_status();
        }

        let event = console::classify(&line);
        self.emit(ServerEvent::log(line));

        let prompt_state = matches!(self.state, ServerState::Starting | ServerState::Online);
        match event {
            ConsoleEvent::PortPrompt if self.state == ServerState::Starting => {
                let port = self.ctx.config.port.to_string();
                self.reply(&port);
            }
            ConsoleEvent::Heartbeat if self.state == ServerState::Starting => {
                self.started_at_unix_ms = Some(unix_ms());
                self.set_state(ServerState::Online);
            }
            ConsoleEvent::EulaPrompt if prompt_state => self.reply("yes"),
            ConsoleEvent::ConfirmEditPrompt if prompt_state => self.reply("keep"),
            ConsoleEvent::GlobalPrompt if prompt_state => self.reply("this"),
            ConsoleEvent::IdleEnter if self.state == ServerState::Online => {
                self.set_state(ServerState::Idle)
            }
            ConsoleEvent::IdleExit if self.state == ServerState::Idle => {
                self.set_state(ServerState::Online)
            }
            ConsoleEvent::VersionAnnounce(version) => {
                tracing::info!(%version, "game version");
                self.game_version = Some(version.clone());
                self.emit(ServerEvent::Version { version });
                self.publish_status();
            }
            _ => {}
        }
    }

    fn reply(&self, text: &str) {
        if let Some(session) = &self.session {
            tracing::debug!(reply = text, "answering server prompt");
            session.write_line(text);
        }
    }

    fn on_exit(&mut self, code: Option<i32>) {
        tracing::info!(?code, "server session ended");
        self.started_at_unix_ms = None;
        self.last_stats = None;
        self.sampler.reset();
        if self.roster.clear() {
            self.emit(ServerEvent::Players {
                players: self.roster.snapshot(),
            });
        }
        self.emit(ServerEvent::ServerExit { code });
        self.set_state(ServerState::Offline);
        self.publish_status();
    }

    fn send_input(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match &self.session {
            Some(session) => session.write_line(text),
            None => tracing::debug!("input dropped; no server running"),
        }
    }

    async fn change_directory(&mut self, path: PathBuf) {
        if !path.is_dir() {
            let err = SupervisorError::InvalidDirectory(path);
            self.emit(ServerEvent::error(err.to_string()));
            return;
        }

        let persisted = PersistedConfig {
            server_path: path.display().to_string(),
        };
        if let Err(e) = save_persisted(&self.ctx.config.config_path(), &persisted).await {
            let err = SupervisorError::Config(format_error_chain(&e));
            tracing::warn!(error = %err, "saving server directory failed");
            self.emit(ServerEvent::error(err.to_string()));
            return;
        }

        tracing::info!(dir = %path.display(), "server directory changed");
        self.emit(ServerEvent::log(format!(
            "Server directory set to {}",
            path.display()
        )));
        self.ctx.config.server_dir = Some(path);
        self.publish_status();
    }

    async fn sample_stats(&mut self) {
        let Some(pid) = self.session.as_ref().and_then(ServerSession::pid) else {
            return;
        };
        if let Some(stats) = self.sampler.sample(pid).await {
            self.last_stats = Some(stats);
            self.emit(stats.into());
            self.publish_status();
        }
    }

    /// Fatal NAT failure: report, operator prompt, kill, give up.
    async fn escalate(
        &mut self,
        err: SupervisorError,
        requests: &mut mpsc::Receiver<ControlRequest>,
    ) -> SupervisorError {
        self.report_fatal(&err).await;
        self.await_fatal_ack(requests).await;

        if let Some(session) = self.session.take() {
            self.finish_session(session).await;
        }
        err
    }

    /// Writes the crash report and publishes the `fatal` event.
    async fn report_fatal(&self, err: &SupervisorError) {
        tracing::error!(error = %err, "NAT traversal exhausted; shutting down");
        self.emit(ServerEvent::log("UPnP unsuccessful. Creating crash log..."));

        let message = err.to_string();
        let crash_report = match write_crash_report(&self.ctx.config.crash_dir(), &message).await
        {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                tracing::error!(error = %format_error_chain(&e), "writing crash report failed");
                None
            }
        };
        self.emit(ServerEvent::Fatal {
            message,
            crash_report,
        });
    }

    async fn await_fatal_ack(&self, requests: &mut mpsc::Receiver<ControlRequest>) {
        let deadline = Instant::now() + self.ctx.config.fatal_ack_timeout;
        loop {
            match tokio::time::timeout_at(deadline, requests.recv()).await {
                Ok(Some(ControlRequest::AcknowledgeFatal | ControlRequest::Shutdown)) => {
                    tracing::info!("fatal error acknowledged");
                    return;
                }
                Ok(Some(ControlRequest::ExternalIp(reply))) => {
                    let _ = reply.send(Err("supervisor is shutting down".to_string()));
                }
                Ok(Some(req)) => tracing::debug!(?req, "request ignored during fatal shutdown"),
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!("fatal error not acknowledged in time");
                    return;
                }
            }
        }
    }

    fn set_state(&mut self, state: ServerState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "server state changed");
        self.state = state;
        self.emit(ServerEvent::State { state });
        self.publish_status();
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn publish_status(&self) {
        let snapshot = StatusSnapshot {
            state: self.state,
            port: self.ctx.config.port,
            session_id: self.session.as_ref().map(|s| s.id().clone()),
            pid: self.session.as_ref().and_then(ServerSession::pid),
            started_at_unix_ms: self.started_at_unix_ms,
            game_version: self.game_version.clone(),
            players: self.roster.snapshot(),
            stats: self.last_stats,
            server_dir: self
                .ctx
                .config
                .server_dir
                .as_ref()
                .map(|d| d.display().to_string()),
        };
        self.ctx.status.send_replace(snapshot);
    }
}

async fn next_output(session: &mut Option<ServerSession>) -> Option<SessionOutput> {
    match session {
        Some(session) => session.next_output().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use tokio::task::JoinHandle;

    use super::*;
    use crate::error::GatewayError;

    #[derive(Default)]
    struct GatewayState {
        opens: AtomicU32,
        closes: AtomicU32,
        failing_opens: AtomicU32,
        failing_closes: AtomicU32,
    }

    #[derive(Clone, Default)]
    struct FakeGateway(Arc<GatewayState>);

    impl FakeGateway {
        fn failing_opens(n: u32) -> Self {
            let gw = Self::default();
            gw.0.failing_opens.store(n, Ordering::SeqCst);
            gw
        }

        fn opens(&self) -> u32 {
            self.0.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> u32 {
            self.0.closes.load(Ordering::SeqCst)
        }

        fn fail_closes(&self, n: u32) {
            self.0.failing_closes.store(n, Ordering::SeqCst);
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl PortMapper for FakeGateway {
        async fn open(&self, port: u16) -> Result<(), GatewayError> {
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.0.failing_opens) {
                return Err(GatewayError::Rejected {
                    action: NatAction::Open,
                    port,
                    message: "ConflictInMappingEntry".to_string(),
                });
            }
            Ok(())
        }

        async fn close(&self, port: u16) -> Result<(), GatewayError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.0.failing_closes) {
                return Err(GatewayError::Rejected {
                    action: NatAction::Close,
                    port,
                    message: "NoSuchEntryInArray".to_string(),
                });
            }
            Ok(())
        }

        async fn external_ip(&self) -> Result<IpAddr, GatewayError> {
            Ok(IpAddr::from([203, 0, 113, 7]))
        }
    }

    /// The test's end of a fake server process.
    struct FakeProcess {
        spec: LaunchSpec,
        out: mpsc::UnboundedSender<SessionOutput>,
        stdin: mpsc::UnboundedReceiver<String>,
    }

    impl FakeProcess {
        fn say(&self, line: &str) {
            self.out.send(SessionOutput::Stdout(line.to_string())).unwrap();
        }

        async fn answer(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(30), self.stdin.recv())
                .await
                .expect("no stdin reply")
                .expect("stdin closed")
        }
    }

    struct FakeLauncher {
        fail: bool,
        spawned: mpsc::UnboundedSender<FakeProcess>,
    }

    impl Launcher for FakeLauncher {
        fn spawn(&self, spec: &LaunchSpec) -> Result<ServerSession, SupervisorError> {
            if self.fail {
                return Err(SupervisorError::Spawn {
                    path: spec.executable.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
            let (kill_tx, kill_rx) = oneshot::channel();

            let on_kill = out_tx.clone();
            tokio::spawn(async move {
                if kill_rx.await.is_ok() {
                    let _ = on_kill.send(SessionOutput::Exited(None));
                }
            });

            let _ = self.spawned.send(FakeProcess {
                spec: spec.clone(),
                out: out_tx,
                stdin: stdin_rx,
            });
            Ok(ServerSession::from_parts(None, stdin_tx, kill_tx, out_rx))
        }
    }

    struct Harness {
        requests: mpsc::Sender<ControlRequest>,
        events: broadcast::Receiver<ServerEvent>,
        status: watch::Receiver<StatusSnapshot>,
        gateway: FakeGateway,
        spawned: mpsc::UnboundedReceiver<FakeProcess>,
        task: JoinHandle<Result<(), SupervisorError>>,
        root: PathBuf,
        port: u16,
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(root: &Path) -> AgentConfig {
        let exe = std::env::current_exe().unwrap();
        let mut config = AgentConfig::with_data_root(root.to_path_buf());
        config.port = free_port();
        config.server_dir = exe.parent().map(Path::to_path_buf);
        config.executable_name = exe.file_name().unwrap().to_string_lossy().into_owned();
        config.fatal_ack_timeout = Duration::from_secs(30);
        config
    }

    fn harness_with(gateway: FakeGateway, fail_spawn: bool, tweak: impl FnOnce(&mut AgentConfig)) -> Harness {
        let root = std::env::temp_dir().join(format!("slnet-controller-{}", uuid::Uuid::new_v4()));
        let mut config = test_config(&root);
        tweak(&mut config);
        let port = config.port;

        let (events, events_rx) = broadcast::channel(512);
        let (status, status_rx) = watch::channel(StatusSnapshot::default());
        let (spawned_tx, spawned) = mpsc::unbounded_channel();
        let (requests, requests_rx) = mpsc::channel(16);

        let ctx = AgentContext {
            config,
            gateway: gateway.clone(),
            launcher: FakeLauncher {
                fail: fail_spawn,
                spawned: spawned_tx,
            },
            events,
            status,
        };
        let task = tokio::spawn(LifecycleController::new(ctx).run(requests_rx));

        Harness {
            requests,
            events: events_rx,
            status: status_rx,
            gateway,
            spawned,
            task,
            root,
            port,
        }
    }

    fn harness(gateway: FakeGateway) -> Harness {
        harness_with(gateway, false, |_| {})
    }

    impl Harness {
        async fn send(&self, req: ControlRequest) {
            self.requests.send(req).await.unwrap();
        }

        async fn wait_for(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            let fut = async {
                loop {
                    match self.events.recv().await {
                        Ok(ev) if pred(&ev) => return ev,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => panic!("event feed closed"),
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(120), fut)
                .await
                .expect("expected event never arrived")
        }

        async fn wait_state(&mut self, state: ServerState) {
            self.wait_for(|e| *e == ServerEvent::State { state }).await;
        }

        async fn next_process(&mut self) -> FakeProcess {
            tokio::time::timeout(Duration::from_secs(30), self.spawned.recv())
                .await
                .expect("server was never spawned")
                .expect("launcher dropped")
        }

        async fn go_online(&mut self) -> FakeProcess {
            self.send(ControlRequest::Start).await;
            let mut p = self.next_process().await;
            p.say("Port number (default: 7777): ");
            assert_eq!(p.answer().await, self.port.to_string());
            p.say("[12:00:00] Received first heartbeat from the central server.");
            self.wait_state(ServerState::Online).await;
            p
        }

        /// Stops the controller and returns every event not yet consumed.
        async fn finish(self) -> (Result<(), SupervisorError>, Vec<ServerEvent>) {
            let _ = self.requests.send(ControlRequest::Shutdown).await;
            let (res, rest, _) = self.join().await;
            (res, rest)
        }

        /// Waits for the controller to return. Also yields the number of crash
        /// reports written before the scratch directory is removed.
        async fn join(mut self) -> (Result<(), SupervisorError>, Vec<ServerEvent>, usize) {
            let res = tokio::time::timeout(Duration::from_secs(120), self.task)
                .await
                .expect("controller did not stop")
                .expect("controller panicked");
            let mut rest = Vec::new();
            loop {
                match self.events.try_recv() {
                    Ok(ev) => rest.push(ev),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            let crash_reports = std::fs::read_dir(self.root.join("crashes"))
                .map(|dir| dir.count())
                .unwrap_or(0);
            let _ = std::fs::remove_dir_all(&self.root);
            (res, rest, crash_reports)
        }
    }

    fn exits(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ServerExit { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_heartbeat_goes_online() {
        let mut h = harness(FakeGateway::default());
        h.send(ControlRequest::Start).await;
        h.wait_state(ServerState::Starting).await;

        let port = h.port;
        h.wait_for(|e| {
            *e == ServerEvent::log(format!("UPnP successful. Port {port} opened successfully!"))
        })
        .await;

        let mut p = h.next_process().await;
        assert_eq!(
            p.spec.args,
            vec!["--port", &port.to_string(), "--color", "--interactive-flag"]
        );
        assert!(p.spec.env.contains(&("FORCE_COLOR".to_string(), "1".to_string())));
        assert_eq!(h.gateway.opens(), 1);

        p.say("Port number (default: 7777): ");
        assert_eq!(p.answer().await, port.to_string());
        assert_eq!(h.status.borrow().state, ServerState::Starting);

        p.say("[12:00:00] Received first heartbeat from the central server.");
        h.wait_state(ServerState::Online).await;
        {
            let status = h.status.borrow();
            assert!(status.started_at_unix_ms.is_some());
            assert!(status.session_id.is_some());
        }

        let (res, _) = h.finish().await;
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_mode_round_trip_returns_online() {
        let mut h = harness(FakeGateway::default());
        let p = h.go_online().await;

        p.say("[12:30:00] Server has entered the idle mode.");
        h.wait_state(ServerState::Idle).await;
        p.say("[12:31:00] Server has exited the idle mode.");
        h.wait_state(ServerState::Online).await;
        assert_eq!(h.status.borrow().state, ServerState::Online);

        let _ = h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn setup_prompts_are_answered() {
        let mut h = harness(FakeGateway::default());
        let mut p = h.go_online().await;

        p.say("Do you accept the EULA? [yes/no]");
        assert_eq!(p.answer().await, "yes");
        p.say("Would you like to edit the config or keep it?");
        assert_eq!(p.answer().await, "keep");
        p.say("Save to this server or the global config?");
        assert_eq!(p.answer().await, "this");

        p.say("[12:00:05] Game version: 14.0.2");
        h.wait_for(|e| *e == ServerEvent::Version { version: "14.0.2".to_string() })
            .await;
        assert_eq!(h.status.borrow().game_version.as_deref(), Some("14.0.2"));

        let _ = h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn input_is_forwarded_and_blank_input_ignored() {
        let mut h = harness(FakeGateway::default());
        let mut p = h.go_online().await;

        h.send(ControlRequest::SendInput("   ".to_string())).await;
        h.send(ControlRequest::SendInput("players".to_string())).await;
        assert_eq!(p.answer().await, "players");

        let _ = h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_port_open_is_fatal_exactly_once() {
        let gateway = FakeGateway::failing_opens(u32::MAX);
        let h = harness(gateway.clone());
        h.send(ControlRequest::Start).await;
        h.send(ControlRequest::AcknowledgeFatal).await;
        // A second start must not produce a second crash report.
        h.send(ControlRequest::Start).await;

        let crash_dir = h.root.join("crashes");
        let root = h.root.clone();
        let task = h.task;
        let res = tokio::time::timeout(Duration::from_secs(120), task)
            .await
            .unwrap()
            .unwrap();

        match res {
            Err(SupervisorError::GatewayExhausted {
                action: NatAction::Open,
                attempts: 3,
                ..
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(gateway.opens(), 3);

        let reports: Vec<_> = std::fs::read_dir(&crash_dir).unwrap().collect();
        assert_eq!(reports.len(), 1);

        let mut events = h.events;
        let mut fatal = 0;
        let mut saw_notice = false;
        while let Ok(ev) = events.try_recv() {
            match ev {
                ServerEvent::Fatal { message, crash_report } => {
                    fatal += 1;
                    assert!(message.starts_with("Failed to open port"));
                    assert!(crash_report.is_some());
                }
                ServerEvent::ServerLog { text } if text == "UPnP unsuccessful. Creating crash log..." => {
                    saw_notice = true
                }
                _ => {}
            }
        }
        assert_eq!(fatal, 1);
        assert!(saw_notice);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_nat_failures_are_retried() {
        let gateway = FakeGateway::failing_opens(2);
        let mut h = harness(gateway.clone());
        h.send(ControlRequest::Start).await;
        let _p = h.next_process().await;
        assert_eq!(gateway.opens(), 3);

        let (res, events) = h.finish().await;
        assert!(res.is_ok());
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Fatal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn occupied_port_is_reported_after_one_retry() {
        let mut h = harness(FakeGateway::default());
        let _holder = std::net::TcpListener::bind(("0.0.0.0", h.port)).unwrap();

        h.send(ControlRequest::Start).await;
        let port = h.port;
        let ev = h
            .wait_for(|e| matches!(e, ServerEvent::ServerError { .. }))
            .await;
        assert_eq!(ev, ServerEvent::error(format!("port {port} is still in use")));
        h.wait_state(ServerState::Offline).await;

        assert_eq!(h.gateway.closes(), 1);
        assert_eq!(h.gateway.opens(), 0);
        assert!(h.spawned.try_recv().is_err());

        let (res, _) = h.finish().await;
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn port_released_during_the_wait_still_starts() {
        let mut h = harness(FakeGateway::default());
        let holder = std::net::TcpListener::bind(("0.0.0.0", h.port)).unwrap();

        h.send(ControlRequest::Start).await;
        let port = h.port;
        h.wait_for(|e| {
            *e == ServerEvent::log(format!("Port {port} is in use. Cleaning up and retrying..."))
        })
        .await;
        drop(holder);

        let _p = h.next_process().await;
        assert_eq!(h.gateway.closes(), 1);
        assert_eq!(h.gateway.opens(), 1);

        let (res, rest) = h.finish().await;
        assert!(res.is_ok());
        assert!(!rest.iter().any(|e| matches!(e, ServerEvent::ServerError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unmaps_and_reports_exit_once() {
        let mut h = harness(FakeGateway::default());
        let _p = h.go_online().await;

        h.send(ControlRequest::Stop).await;
        h.wait_for(|e| *e == ServerEvent::ServerExit { code: None })
            .await;
        h.wait_state(ServerState::Offline).await;
        assert_eq!(h.gateway.closes(), 1);

        // Nothing left to stop.
        h.send(ControlRequest::Stop).await;

        let (res, rest) = h.finish().await;
        assert!(res.is_ok());
        assert_eq!(exits(&rest), 0);
        assert_eq!(unmap_notices(&rest), 0);
    }

    fn fatals(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Fatal { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_unmap_on_stop_is_fatal() {
        let mut h = harness(FakeGateway::default());
        let _p = h.go_online().await;
        h.gateway.fail_closes(u32::MAX);

        h.send(ControlRequest::Stop).await;
        h.send(ControlRequest::AcknowledgeFatal).await;
        let gateway = h.gateway.clone();
        let (res, rest, crash_reports) = h.join().await;

        match res {
            Err(SupervisorError::GatewayExhausted {
                action: NatAction::Close,
                attempts: 3,
                ..
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(gateway.closes(), 3);
        assert_eq!(crash_reports, 1);
        assert_eq!(exits(&rest), 1);
        assert_eq!(fatals(&rest), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_unmap_on_shutdown_still_writes_a_report() {
        let mut h = harness(FakeGateway::default());
        let _p = h.go_online().await;
        h.gateway.fail_closes(u32::MAX);

        h.send(ControlRequest::Shutdown).await;
        let gateway = h.gateway.clone();
        let (res, rest, crash_reports) = h.join().await;

        match res {
            Err(SupervisorError::GatewayExhausted {
                action: NatAction::Close,
                attempts: 3,
                ..
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(gateway.closes(), 3);
        assert_eq!(crash_reports, 1);
        assert_eq!(exits(&rest), 1);
        assert_eq!(fatals(&rest), 1);
    }

    fn unmap_notices(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ServerLog { text } if text.ends_with("closed.")))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn process_exit_clears_session_and_roster() {
        let mut h = harness(FakeGateway::default());
        let p = h.go_online().await;

        p.say("[2024-01-01 12:00:00] Player 123@steam preauthenticated from endpoint 10.0.0.5:1000.");
        h.wait_for(|e| matches!(e, ServerEvent::Players { players } if players.len() == 1))
            .await;
        assert!(h.status.borrow().players.contains_key("123"));

        p.out.send(SessionOutput::Exited(Some(0))).unwrap();
        h.wait_for(|e| *e == ServerEvent::ServerExit { code: Some(0) })
            .await;
        h.wait_state(ServerState::Offline).await;
        {
            let status = h.status.borrow();
            assert!(status.players.is_empty());
            assert_eq!(status.started_at_unix_ms, None);
            assert_eq!(status.session_id, None);
        }

        let (res, rest) = h.finish().await;
        assert!(res.is_ok());
        assert_eq!(exits(&rest), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_spawn_releases_the_mapping() {
        let gateway = FakeGateway::default();
        let mut h = harness_with(gateway.clone(), true, |_| {});

        h.send(ControlRequest::Start).await;
        let ev = h
            .wait_for(|e| matches!(e, ServerEvent::ServerError { .. }))
            .await;
        let ServerEvent::ServerError { message } = ev else {
            unreachable!()
        };
        assert!(message.starts_with("failed to spawn"));
        h.wait_state(ServerState::Offline).await;
        assert_eq!(gateway.opens(), 1);
        assert_eq!(gateway.closes(), 1);

        let (res, _) = h.finish().await;
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_executable_never_leaves_offline() {
        let gateway = FakeGateway::default();
        let mut h = harness_with(gateway.clone(), false, |cfg| {
            cfg.executable_name = "LocalAdmin-does-not-exist".to_string();
        });

        h.send(ControlRequest::Start).await;
        let ev = h
            .wait_for(|e| matches!(e, ServerEvent::ServerError { .. }))
            .await;
        let ServerEvent::ServerError { message } = ev else {
            unreachable!()
        };
        assert!(message.starts_with("Server executable not found"));
        assert_eq!(gateway.opens(), 0);

        let (res, rest) = h.finish().await;
        assert!(res.is_ok());
        assert!(!rest.iter().any(|e| matches!(e, ServerEvent::State { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_exception_on_stderr_stops_the_server() {
        let mut h = harness(FakeGateway::default());
        let p = h.go_online().await;

        p.out
            .send(SessionOutput::Stderr(
                "System.Exception: unhandled exception in round manager".to_string(),
            ))
            .unwrap();
        h.wait_for(|e| {
            *e == ServerEvent::log("Error: System.Exception: unhandled exception in round manager")
        })
        .await;
        h.wait_for(|e| matches!(e, ServerEvent::ServerExit { .. }))
            .await;
        h.wait_state(ServerState::Offline).await;
        assert_eq!(h.gateway.closes(), 1);

        let _ = h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn directory_change_is_validated_and_persisted() {
        let mut h = harness(FakeGateway::default());

        let missing = h.root.join("no-such-dir");
        h.send(ControlRequest::ChangeDirectory(missing.clone())).await;
        let ev = h
            .wait_for(|e| matches!(e, ServerEvent::ServerError { .. }))
            .await;
        assert_eq!(
            ev,
            ServerEvent::error(format!("not a directory: {}", missing.display()))
        );

        let dir = h.root.join("scpsl");
        std::fs::create_dir_all(&dir).unwrap();
        h.send(ControlRequest::ChangeDirectory(dir.clone())).await;
        h.wait_for(|e| matches!(e, ServerEvent::ServerLog { text } if text.starts_with("Server directory set")))
            .await;

        assert_eq!(
            h.status.borrow().server_dir.as_deref(),
            Some(dir.display().to_string().as_str())
        );
        let saved = crate::config::load_persisted(&h.root.join("config.json"))
            .await
            .unwrap();
        assert_eq!(saved.server_dir(), Some(dir));

        let _ = h.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_ip_comes_from_the_gateway() {
        let h = harness(FakeGateway::default());
        let (tx, rx) = oneshot::channel();
        h.send(ControlRequest::ExternalIp(tx)).await;
        assert_eq!(rx.await.unwrap(), Ok(IpAddr::from([203, 0, 113, 7])));

        let _ = h.finish().await;
    }
}
