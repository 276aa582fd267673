use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use irc::proto::{command, Command, Message};
use irc::{connection, Codec, Connection};

use crate::config::Config;
use crate::context::{JoinStatus, Line};
use crate::event::{Bus, Event};
use crate::file_transfer::{self, manager, task, FileTransfer};
use crate::server;
use crate::store::{ConnectionInfo, ConnectionState, Store};
use crate::user::Nick;

pub mod cap;
pub mod registration;
pub mod route;
pub mod sasl;

/// Reconnect backoff: 2s initial, doubling to a 60s cap, full jitter.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

type TransferUpdates = SelectAll<BoxStream<'static, task::Update>>;

/// Commands submitted by the UI/command surface.
#[derive(Debug)]
pub enum Input {
    Connect(Option<ConnectionInfo>),
    Disconnect { reason: Option<String> },
    Quit { reason: Option<String> },
    /// Pre-built message from the command surface.
    Raw(Message),
    DccSend {
        to: Nick,
        path: PathBuf,
        passive: bool,
    },
    DccAccept(file_transfer::Id),
    DccCancel(file_transfer::Id),
}

/// How a connected session ended, when not by error.
enum SessionEnd {
    Manual,
    Quit,
}

enum Phase {
    Cap(cap::Negotiation),
    Sasl {
        auth: sasl::Authentication,
        negotiation: cap::Negotiation,
    },
    Registering {
        registration: registration::Registration,
        sasl_succeeded: bool,
    },
    Ready(route::Router),
}

impl Phase {
    fn placeholder() -> Self {
        Phase::Cap(cap::Negotiation::start(BTreeSet::new(), false).0)
    }
}

/// Owns the connection lifecycle: transport, CAP, SASL, registration,
/// then steady-state dispatch. The single writer of `ConnectionState`.
pub struct Client {
    config: Config,
    store: Arc<Store>,
    bus: Arc<Bus>,
    transfers: manager::Manager,
}

impl Client {
    pub fn new(config: Config, store: Arc<Store>, bus: Arc<Bus>) -> Self {
        let transfers = manager::Manager::new(config.dcc.clone());

        Self {
            config,
            store,
            bus,
            transfers,
        }
    }

    /// Drives the client until `Quit` (or the input channel closes).
    pub async fn run(mut self, mut inputs: mpsc::Receiver<Input>) {
        loop {
            let Some(input) = inputs.recv().await else {
                break;
            };

            match input {
                Input::Connect(info) => {
                    if !self.prepare(info) {
                        continue;
                    }

                    if let SessionEnd::Quit = self.session(&mut inputs).await {
                        break;
                    }
                }
                Input::Quit { .. } => break,
                _ => {}
            }
        }

        if let Err(e) = self.store.flush() {
            log::error!("failed to persist state on shutdown: {e}");
        }
    }

    /// Validates and stores the connection info for the next attempt.
    fn prepare(&self, info: Option<ConnectionInfo>) -> bool {
        let info = info
            .or_else(|| self.store.connection_info())
            .unwrap_or_else(|| self.config.server.connection_info());

        match self.store.set_connection_info(info) {
            Ok(()) => {
                self.store.set_last_server(&self.config.server.key());
                true
            }
            Err(e) => {
                // Configuration must be clean before leaving
                // Disconnected
                self.store
                    .set_connection_state(ConnectionState::ConfigError);
                self.status(format!("cannot connect: {e}"));
                false
            }
        }
    }

    /// Connect-with-reconnect: one session spans every backoff retry
    /// until it ends manually, fatally, or the channel closes.
    async fn session(&mut self, inputs: &mut mpsc::Receiver<Input>) -> SessionEnd {
        let mut attempt = 0u32;

        loop {
            match self.attempt(inputs).await {
                Ok(end) => {
                    self.disconnected(None);
                    return end;
                }
                Err(e) => {
                    self.disconnected(Some(&e));

                    if !(e.retryable() && self.config.features.auto_reconnect) {
                        return SessionEnd::Manual;
                    }

                    attempt += 1;
                    let delay = backoff_delay(attempt);

                    self.bus.publish(Event::new(
                        "CLIENT_RECONNECTING",
                        json!({
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    ));
                    self.status(format!(
                        "reconnecting in {:.1}s (attempt {attempt})",
                        delay.as_secs_f32()
                    ));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        input = inputs.recv() => match input {
                            Some(Input::Quit { .. }) | None => return SessionEnd::Quit,
                            // Manual disconnect cancels the backoff
                            Some(Input::Disconnect { .. }) => return SessionEnd::Manual,
                            Some(Input::Connect(info)) => {
                                if !self.prepare(info) {
                                    return SessionEnd::Manual;
                                }
                                attempt = 0;
                            }
                            Some(_) => {}
                        },
                    }
                }
            }
        }
    }

    /// Marks the end of an attempt: the one place the terminal
    /// disconnect is made observable.
    fn disconnected(&self, error: Option<&Error>) {
        let reason = error.map(ToString::to_string);

        if let Some(reason) = &reason {
            let _ = self
                .store
                .set("last_error", json!({"reason": reason, "at": Utc::now()}));
            self.status(format!("disconnected: {reason}"));
        } else {
            self.status("disconnected");
        }

        self.store
            .set_connection_state(ConnectionState::Disconnected);
        self.bus.publish(Event::new(
            "CLIENT_DISCONNECTED",
            json!({"reason": reason}),
        ));
    }

    /// One full connection attempt and, if it reaches `Ready`, the
    /// steady-state loop.
    async fn attempt(
        &mut self,
        inputs: &mut mpsc::Receiver<Input>,
    ) -> Result<SessionEnd, Error> {
        let info = self
            .store
            .connection_info()
            .ok_or_else(|| Error::Config("no connection configured".to_string()))?;

        self.store.set_connection_state(ConnectionState::Connecting);
        self.bus.publish(Event::new(
            "CLIENT_CONNECTING",
            json!({"server": info.server, "port": info.port}),
        ));
        self.status(format!("connecting to {}:{}", info.server, info.port));

        let security = if info.use_tls {
            connection::Security::Secured {
                accept_invalid_certs: !info.verify_tls,
            }
        } else {
            connection::Security::Unsecured
        };

        let connection = Connection::new(
            connection::Config {
                server: &info.server,
                port: info.port,
                security,
            },
            Codec::new(),
        )
        .await
        .map_err(Error::from_connect)?;

        if info.use_tls && !info.verify_tls {
            self.status("certificate verification is DISABLED for this connection");
            self.bus.publish(Event::new(
                "TLS_VERIFICATION_DISABLED",
                json!({"server": info.server}),
            ));
        }

        self.bus.publish(Event::new(
            "CLIENT_CONNECTED",
            json!({
                "server": info.server,
                "port": info.port,
                "nick": info.nick,
                "ssl": info.use_tls,
            }),
        ));

        let local_ip = connection.local_addr().map(|addr| addr.ip());
        let (handle, mut write_queue) = server::channel();
        let (mut sink, mut stream) = connection.split();

        // CAP phase opens the pipeline
        self.store
            .set_connection_state(ConnectionState::CapNegotiating);
        self.bus
            .publish(Event::new("CLIENT_CAP_NEGOTIATION_START", json!({})));

        let requested = info.caps.iter().cloned().collect::<BTreeSet<_>>();
        let (negotiation, opening) =
            cap::Negotiation::start(requested, info.sasl_credentials().is_some());
        handle
            .send(opening)
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut phase = Phase::Cap(negotiation);
        let mut transfer_updates: TransferUpdates = SelectAll::new();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut persist = tokio::time::interval(
            self.store.save_interval().max(Duration::from_secs(1)),
        );
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.dcc.cleanup_interval_seconds.max(1),
        ));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Burn the immediate first tick of each interval
        persist.reset();
        sweep.reset();

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    let Some(inbound) = inbound else {
                        return Err(Error::Transport("connection closed by peer".to_string()));
                    };

                    match inbound {
                        Ok(Ok(message)) => {
                            self.dispatch(
                                &mut phase,
                                &message,
                                &handle,
                                &info,
                                local_ip,
                                &mut transfer_updates,
                            )
                            .await?;
                        }
                        // A malformed line never kills the session
                        Ok(Err(parse_error)) => {
                            log::warn!("dropping malformed line: {parse_error}");
                        }
                        Err(e) => {
                            return Err(Error::Transport(e.to_string()));
                        }
                    }
                }
                queued = write_queue.recv() => {
                    // The handle lives on this stack frame, so the
                    // queue never closes under us
                    if let Some(message) = queued {
                        sink.send(message)
                            .await
                            .map_err(|e| Error::Transport(e.to_string()))?;
                    }
                }
                input = inputs.recv() => {
                    let Some(input) = input else {
                        return Ok(SessionEnd::Quit);
                    };

                    match input {
                        Input::Disconnect { reason } => {
                            self.store.set_connection_state(ConnectionState::Disconnecting);
                            let reason = reason.unwrap_or_else(|| "leaving".to_string());
                            let _ = sink.send(command!("QUIT", reason)).await;
                            let _ = sink.close().await;
                            return Ok(SessionEnd::Manual);
                        }
                        Input::Quit { reason } => {
                            self.store.set_connection_state(ConnectionState::Disconnecting);
                            let reason = reason.unwrap_or_else(|| "leaving".to_string());
                            let _ = sink.send(command!("QUIT", reason)).await;
                            let _ = sink.close().await;
                            return Ok(SessionEnd::Quit);
                        }
                        Input::Connect(_) => {
                            self.status("already connected; /disconnect first");
                        }
                        Input::Raw(message) => {
                            if let Err(e) = handle.send(message) {
                                self.status(format!("cannot send: {e}"));
                            }
                        }
                        Input::DccSend { to, path, passive } => {
                            match self.transfers.send(
                                manager::SendRequest { to: to.clone(), path, passive },
                                local_ip,
                                &handle,
                            ).await {
                                Ok((id, manager::Event::RunTask(updates))) => {
                                    transfer_updates.push(updates);
                                    self.status(format!("offering file to {to} (transfer {id})"));
                                }
                                Err(e) => self.status(format!("dcc send failed: {e}")),
                            }
                        }
                        Input::DccAccept(id) => {
                            match self.transfers.approve(id, local_ip, &handle).await {
                                Ok(manager::Event::RunTask(updates)) => {
                                    transfer_updates.push(updates);
                                }
                                Err(e) => self.status(format!("dcc accept failed: {e}")),
                            }
                        }
                        Input::DccCancel(id) => {
                            if let Err(e) = self.transfers.cancel(id) {
                                self.status(format!("dcc cancel failed: {e}"));
                            }
                        }
                    }
                }
                update = transfer_updates.next(), if !transfer_updates.is_empty() => {
                    if let Some(update) = update {
                        if let Some(transfer) = self.transfers.update(update) {
                            self.transfer_changed(&transfer);
                        }
                    }
                }
                _ = tick.tick() => {
                    self.check_deadlines(&mut phase, &handle, &info)?;
                }
                _ = persist.tick() => {
                    if let Err(e) = self.store.flush() {
                        log::error!("periodic state flush failed: {e}");
                    }
                }
                _ = sweep.tick() => {
                    for transfer in self.transfers.sweep(Utc::now()) {
                        self.transfer_changed(&transfer);
                    }
                }
            }
        }
    }

    /// Feeds an inbound message to the current phase, advancing it when
    /// the phase reports completion. State mutations for one line are
    /// complete before the next line is dispatched.
    async fn dispatch(
        &mut self,
        phase: &mut Phase,
        message: &Message,
        handle: &server::Handle,
        info: &ConnectionInfo,
        local_ip: Option<std::net::IpAddr>,
        transfer_updates: &mut TransferUpdates,
    ) -> Result<(), Error> {
        match phase {
            Phase::Cap(negotiation) => match negotiation.handle(message) {
                cap::Step::Continue(messages) => self.send_all(handle, messages),
                cap::Step::StartSasl(messages) => {
                    self.send_all(handle, messages);

                    let (username, password) = info
                        .sasl_credentials()
                        .ok_or_else(|| Error::Config("sasl acked without credentials".into()))?;

                    self.store
                        .set_connection_state(ConnectionState::Authenticating);
                    self.bus
                        .publish(Event::new("CLIENT_AUTHENTICATING", json!({})));
                    self.status("authenticating (SASL PLAIN)");

                    let (auth, opening) = sasl::Authentication::start(username, password);
                    self.send_all(handle, vec![opening]);

                    let Phase::Cap(negotiation) =
                        std::mem::replace(phase, Phase::placeholder())
                    else {
                        unreachable!("checked above");
                    };
                    *phase = Phase::Sasl { auth, negotiation };
                }
                cap::Step::Done(messages) => {
                    self.send_all(handle, messages);
                    self.cap_complete(phase, handle, info, false);
                }
                cap::Step::Unhandled => {
                    self.pre_ready(message, handle)?;
                }
            },
            Phase::Sasl { auth, negotiation } => match auth.handle(message) {
                Ok(sasl::Step::Continue(messages)) => self.send_all(handle, messages),
                Ok(sasl::Step::Success) => {
                    self.bus
                        .publish(Event::new("CLIENT_AUTHENTICATED", json!({})));
                    self.status("SASL authentication successful");

                    if let cap::Step::Done(messages) = negotiation.sasl_finished() {
                        self.send_all(handle, messages);
                    }
                    self.cap_complete(phase, handle, info, true);
                }
                Ok(sasl::Step::Unhandled) => {
                    self.pre_ready(message, handle)?;
                }
                Err(sasl::Error::Denied) => return Err(Error::Sasl(sasl::Error::Denied)),
                Err(e) => {
                    // Non-fatal SASL failure: finish CAP and register
                    // unauthenticated
                    self.status(format!(
                        "SASL failed: {e}; continuing without authentication"
                    ));

                    if let cap::Step::Done(messages) = negotiation.sasl_finished() {
                        self.send_all(handle, messages);
                    }
                    self.cap_complete(phase, handle, info, false);
                }
            },
            Phase::Registering {
                registration,
                sasl_succeeded,
            } => match registration.handle(message) {
                Ok(registration::Step::Continue(messages)) => {
                    self.send_all(handle, messages)
                }
                Ok(registration::Step::Registered { nick, server }) => {
                    let sasl_succeeded = *sasl_succeeded;
                    self.registered(phase, handle, info, nick, server, sasl_succeeded);
                }
                Ok(registration::Step::Unhandled) => {
                    self.pre_ready(message, handle)?;
                }
                Err(e) => return Err(Error::Registration(e)),
            },
            Phase::Ready(router) => {
                let output = router
                    .handle(message, &self.store, &self.bus)
                    .map_err(|route::Error::Remote(reason)| Error::Remote(reason))?;

                self.send_all(handle, output.outbound);

                if let Some(inbound) = output.dcc {
                    self.dcc_inbound(inbound, handle, local_ip, transfer_updates)
                        .await;
                }
            }
        }

        Ok(())
    }

    /// CAP negotiation finished: record the set, lift the line limit
    /// when `message-tags` was granted, and start registration.
    fn cap_complete(
        &mut self,
        phase: &mut Phase,
        handle: &server::Handle,
        info: &ConnectionInfo,
        sasl_succeeded: bool,
    ) {
        let negotiated = match phase {
            Phase::Cap(negotiation) => negotiation.negotiated().clone(),
            Phase::Sasl { negotiation, .. } => negotiation.negotiated().clone(),
            _ => BTreeSet::new(),
        };

        handle.set_message_tags(negotiated.contains("message-tags"));

        self.bus.publish(Event::new(
            "CLIENT_CAP_NEGOTIATION_COMPLETE",
            json!({"caps": negotiated.iter().collect::<Vec<_>>()}),
        ));
        if !negotiated.is_empty() {
            self.status(format!(
                "capabilities: {}",
                negotiated.iter().cloned().collect::<Vec<_>>().join(" ")
            ));
        }

        self.store
            .set_connection_state(ConnectionState::Registering);
        self.bus.publish(Event::new("CLIENT_REGISTERING", json!({})));

        let (registration, burst) = registration::Registration::start(info);
        self.send_all(handle, burst);

        *phase = Phase::Registering {
            registration,
            sasl_succeeded,
        };
    }

    /// RPL_WELCOME: record the confirmed identity, auto-join, identify,
    /// and enter steady state.
    fn registered(
        &mut self,
        phase: &mut Phase,
        handle: &server::Handle,
        info: &ConnectionInfo,
        nick: String,
        server: Option<String>,
        sasl_succeeded: bool,
    ) {
        self.store.set_connection_state(ConnectionState::Registered);
        self.bus.publish(Event::new(
            "CLIENT_REGISTERED",
            json!({"nick": nick, "server": server}),
        ));

        if let Some(mut stored) = self.store.connection_info() {
            stored.nick = nick.clone();
            if let Err(e) = self.store.set_connection_info(stored) {
                log::warn!("failed to record confirmed nick: {e}");
            }
        }

        // Auto-join the configured channels
        for channel in &info.channels {
            self.store.contexts_mut(|contexts| {
                contexts.ensure_channel(channel).join_status = Some(JoinStatus::JoinSent);
            });
            if let Err(e) = handle.send(command!("JOIN", channel.clone())) {
                self.status(format!("cannot join {channel}: {e}"));
            }
        }

        // NickServ fallback when SASL did not do the job
        if !sasl_succeeded {
            if let Some(password) = &info.nickserv_password {
                let _ = handle.send(command!(
                    "PRIVMSG",
                    "NickServ",
                    format!("IDENTIFY {password}")
                ));
                self.status("identifying with NickServ");
            }
        }

        self.store.set_connection_state(ConnectionState::Ready);
        self.bus
            .publish(Event::new("CLIENT_READY", json!({"nick": nick})));
        self.status(format!("ready as {nick}"));

        *phase = Phase::Ready(route::Router::new(nick));
    }

    /// Minimal handling for messages that arrive before the dispatcher
    /// exists: PING must be answered, ERROR is fatal, notices land in
    /// status.
    fn pre_ready(&self, message: &Message, handle: &server::Handle) -> Result<(), Error> {
        match &message.command {
            Command::PING(token) => {
                let _ = handle.send(Command::PONG(token.clone(), None).into());
            }
            Command::ERROR(reason) => return Err(Error::Remote(reason.clone())),
            Command::NOTICE(_, text) | Command::PRIVMSG(_, text) => {
                self.status(text);
            }
            Command::Numeric(_, params) => {
                if let Some(text) = params.last() {
                    self.status(text);
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Phase deadlines, evaluated once per second. Timeouts are
    /// cancellation after a deadline.
    fn check_deadlines(
        &mut self,
        phase: &mut Phase,
        handle: &server::Handle,
        info: &ConnectionInfo,
    ) -> Result<(), Error> {
        let now = tokio::time::Instant::now();

        match phase {
            Phase::Cap(negotiation) => {
                if negotiation.timed_out(now) {
                    if self.config.features.continue_without_caps {
                        self.status(
                            "capability negotiation timed out; continuing without",
                        );
                        let _ = handle.send(command!("CAP", "END"));
                        self.cap_complete(phase, handle, info, false);
                    } else {
                        return Err(Error::CapTimeout);
                    }
                }
            }
            Phase::Sasl { auth, negotiation } => {
                if auth.timed_out(now) {
                    self.status("SASL timed out; continuing without authentication");

                    if let cap::Step::Done(messages) = negotiation.sasl_finished() {
                        self.send_all(handle, messages);
                    }
                    self.cap_complete(phase, handle, info, false);
                }
            }
            Phase::Registering { registration, .. } => {
                if registration.timed_out(now) {
                    return Err(Error::Registration(registration::Error::Timeout));
                }
            }
            Phase::Ready(_) => {}
        }

        Ok(())
    }

    async fn dcc_inbound(
        &mut self,
        inbound: route::DccInbound,
        handle: &server::Handle,
        local_ip: Option<std::net::IpAddr>,
        transfer_updates: &mut TransferUpdates,
    ) {
        match inbound {
            route::DccInbound::Offer { from, send } => {
                let filename = send.filename().to_string();
                let size = send.size();

                match self
                    .transfers
                    .receive(
                        manager::ReceiveRequest {
                            from: from.clone(),
                            dcc_send: send,
                        },
                        local_ip,
                        handle,
                    )
                    .await
                {
                    Ok(manager::Received::PassiveConfirmed(_)) => {}
                    Ok(manager::Received::Offered(id)) => {
                        self.status(format!(
                            "{from} offers {filename:?} ({size} bytes); transfer {id} pending"
                        ));
                        self.bus.publish(Event::new(
                            "DCC_OFFER",
                            json!({
                                "id": id.to_string(),
                                "nick": from.to_string(),
                                "filename": filename,
                                "size": size,
                            }),
                        ));
                    }
                    Ok(manager::Received::Accepted(id, manager::Event::RunTask(updates))) => {
                        transfer_updates.push(updates);
                        self.status(format!(
                            "auto-accepting {filename:?} from {from} (transfer {id})"
                        ));
                    }
                    Err(e) => {
                        self.status(format!("rejected transfer from {from}: {e}"));
                        self.bus.publish(Event::new(
                            "DCC_REJECTED",
                            json!({
                                "nick": from.to_string(),
                                "filename": filename,
                                "reason": e.to_string(),
                            }),
                        ));
                    }
                }
            }
            route::DccInbound::Resume { from, transfer } => {
                match self.transfers.resume_requested(&from, transfer, handle) {
                    Ok(id) => self.status(format!("{from} resumes transfer {id}")),
                    Err(e) => log::debug!("ignoring DCC RESUME from {from}: {e}"),
                }
            }
            route::DccInbound::Accept { from, transfer } => {
                match self.transfers.resume_accepted(&from, transfer) {
                    Ok(id) => self.status(format!("transfer {id} resuming")),
                    Err(e) => log::debug!("ignoring DCC ACCEPT from {from}: {e}"),
                }
            }
        }
    }

    /// Surfaces a transfer state change: status line, bus event, and
    /// the persisted history summary for terminal states.
    fn transfer_changed(&self, transfer: &FileTransfer) {
        use file_transfer::Status;

        match &transfer.status {
            Status::Completed => {
                self.status(format!(
                    "transfer {} of {:?} completed ({} bytes)",
                    transfer.id, transfer.filename, transfer.transferred
                ));
            }
            Status::Failed { error } => {
                self.status(format!(
                    "transfer {} of {:?} failed: {error}",
                    transfer.id, transfer.filename
                ));
            }
            Status::Cancelled => {
                self.status(format!(
                    "transfer {} of {:?} cancelled",
                    transfer.id, transfer.filename
                ));
            }
            _ => {}
        }

        self.bus.publish(Event::new(
            "DCC_TRANSFER_STATUS",
            json!({
                "id": transfer.id.to_string(),
                "nick": transfer.remote_user.to_string(),
                "filename": transfer.filename,
                "direction": transfer.direction.to_string(),
                "status": transfer.status.to_string(),
                "transferred": transfer.transferred,
                "size": transfer.size,
            }),
        ));

        if transfer.status.is_terminal() {
            self.store.push_transfer_summary(transfer.summary());
        }
    }

    fn send_all(&self, handle: &server::Handle, messages: Vec<Message>) {
        for message in messages {
            if let Err(e) = handle.send(message) {
                log::error!("failed to enqueue outbound line: {e}");
            }
        }
    }

    fn status(&self, text: impl ToString) {
        let text = text.to_string();

        self.store.contexts_mut(|contexts| {
            contexts.status_mut().append(Line::new(&text));
        });
        self.bus.publish(Event::new("STATUS", json!({"text": text})));
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let max = BACKOFF_INITIAL
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(BACKOFF_CAP);

    // Full jitter over [0, max]
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("server certificate rejected: {0}")]
    CertificateRejected(String),
    #[error("capability negotiation timed out")]
    CapTimeout,
    #[error("sasl: {0}")]
    Sasl(sasl::Error),
    #[error("registration failed: {0}")]
    Registration(registration::Error),
    #[error("server closed the session: {0}")]
    Remote(String),
}

impl Error {
    fn from_connect(error: connection::Error) -> Self {
        match error {
            connection::Error::Tls(tls) => match &tls {
                irc::rustls::Error::InvalidCertificate(_) => {
                    Error::CertificateRejected(tls.to_string())
                }
                _ => Error::TlsHandshake(tls.to_string()),
            },
            other => Error::Transport(other.to_string()),
        }
    }

    /// Whether the orchestrator may schedule an automatic reconnect.
    fn retryable(&self) -> bool {
        match self {
            Error::Transport(_)
            | Error::TlsHandshake(_)
            | Error::CapTimeout
            | Error::Remote(_)
            | Error::Registration(_) => true,
            Error::Sasl(e) => !matches!(e, sasl::Error::Denied),
            Error::Config(_) | Error::CertificateRejected(_) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config;

    #[test]
    fn backoff_is_capped_with_full_jitter() {
        for attempt in 1..100 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_CAP);
        }

        // Early attempts stay under the exponential envelope
        for _ in 0..50 {
            assert!(backoff_delay(1) <= BACKOFF_INITIAL);
            assert!(backoff_delay(2) <= BACKOFF_INITIAL * 2);
        }
    }

    #[test]
    fn error_classification() {
        assert!(Error::Transport("broken pipe".into()).retryable());
        assert!(Error::CapTimeout.retryable());
        assert!(Error::Registration(registration::Error::Timeout).retryable());
        assert!(Error::Registration(registration::Error::NickUnavailable("x".into()))
            .retryable());
        assert!(Error::Sasl(sasl::Error::Timeout).retryable());

        assert!(!Error::Sasl(sasl::Error::Denied).retryable());
        assert!(!Error::Config("bad".into()).retryable());
        assert!(!Error::CertificateRejected("expired".into()).retryable());
    }

    struct ScriptedServer {
        reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl ScriptedServer {
        async fn accept(listener: TcpListener) -> Self {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, writer) = socket.into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn expect(&mut self, prefix: &str) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            assert!(
                line.starts_with(prefix),
                "expected line starting with {prefix:?}, got {line:?}"
            );
            line
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }
    }

    /// Full handshake against a scripted server: CAP, SASL PLAIN, nick
    /// collision retry, welcome, auto-join, PING/PONG.
    #[tokio::test]
    async fn handshake_end_to_end() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(
            dir.path().join("state.json"),
            100,
            Duration::from_secs(300),
            false,
        ));
        let bus = Arc::new(Bus::new());

        let mut config = config::Config::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = port;
        config.server.use_tls = false;
        config.server.nick = "desirednick".into();
        config.server.sasl_username = Some("alice".into());
        config.server.sasl_password = Some("secret".into());
        config.server.channels = vec!["#tern".into()];
        config.server.caps = vec!["sasl".into(), "multi-prefix".into()];

        let client = Client::new(config, store.clone(), bus.clone());
        let (inputs, input_rx) = mpsc::channel(16);

        let client_task = tokio::spawn(client.run(input_rx));
        inputs.send(Input::Connect(None)).await.unwrap();

        let script = async {
            let mut server = ScriptedServer::accept(listener).await;

            server.expect("CAP LS 302").await;
            server.send(":irc.test CAP * LS :sasl multi-prefix").await;

            server.expect("CAP REQ :multi-prefix sasl").await;
            server.send(":irc.test CAP * ACK :multi-prefix sasl").await;

            server.expect("AUTHENTICATE PLAIN").await;
            server.send("AUTHENTICATE +").await;

            let credentials = server.expect("AUTHENTICATE ").await;
            assert_eq!(credentials, "AUTHENTICATE AGFsaWNlAHNlY3JldA==");
            server
                .send(":irc.test 903 desirednick :SASL authentication successful")
                .await;

            server.expect("CAP END").await;
            server.expect("NICK desirednick").await;
            server.expect("USER ").await;

            server
                .send(":irc.test 433 * desirednick :Nickname is already in use")
                .await;
            server.expect("NICK desirednick_").await;

            server
                .send(":irc.test 001 desirednick_ :Welcome to the test network")
                .await;

            server.expect("JOIN #tern").await;

            server.send("PING :roundtrip").await;
            let pong = server.expect("PONG").await;
            assert!(pong.contains("roundtrip"));

            server
        };

        let mut server = tokio::time::timeout(Duration::from_secs(10), script)
            .await
            .expect("handshake script timed out");

        assert_eq!(store.connection_state(), ConnectionState::Ready);
        assert_eq!(store.connection_info().unwrap().nick, "desirednick_");

        inputs
            .send(Input::Quit { reason: None })
            .await
            .unwrap();

        let quit = tokio::time::timeout(Duration::from_secs(5), async {
            let mut line = String::new();
            server.reader.read_line(&mut line).await.unwrap();
            line
        })
        .await
        .expect("expected QUIT");
        assert!(quit.starts_with("QUIT"));

        tokio::time::timeout(Duration::from_secs(5), client_task)
            .await
            .expect("client did not exit")
            .unwrap();
    }

    #[tokio::test]
    async fn connection_refused_is_reported() {
        // Bind and drop to get a (very likely) dead port
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(
            dir.path().join("state.json"),
            100,
            Duration::from_secs(300),
            false,
        ));
        let bus = Arc::new(Bus::new());

        let mut config = config::Config::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = port;
        config.server.use_tls = false;
        config.server.nick = "tern".into();
        // No retries: fail once and stop
        config.features.auto_reconnect = false;

        let client = Client::new(config, store.clone(), bus.clone());
        let (inputs, input_rx) = mpsc::channel(16);

        let client_task = tokio::spawn(client.run(input_rx));
        inputs.send(Input::Connect(None)).await.unwrap();

        // Wait for the attempt to fail and settle back to Disconnected
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if store.get("last_error").is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no failure recorded");

        assert_eq!(store.connection_state(), ConnectionState::Disconnected);

        inputs.send(Input::Quit { reason: None }).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client_task)
            .await
            .expect("client did not exit")
            .unwrap();
    }
}
