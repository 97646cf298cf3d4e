//! Per-hub session: owner task, transport loop and API surface.
//!
//! Every configured hub runs exactly one owner task. The task holds the
//! framed serial stream, the correlator, the pairing session and the
//! registry, and processes three input sources in a single `select!` loop:
//! API requests (mpsc with oneshot replies), decoded frames, and timer
//! deadlines (command timeout, idle-link watchdog, pairing window). Because
//! all mutation happens on this one task, per-hub state needs no locking and
//! telemetry is applied in wire arrival order.
//!
//! On link loss the task cancels every pending command and the active
//! pairing session, flags the hub `Error`, and reconnects with exponential
//! backoff. Dropping the last [`HubHandle`] shuts the task down.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};
use ajaxbridge_core::{
    ArmedState, ConnectionState, DeviceId, DeviceType, Error, HubId, Result, SensitivityLevel,
    SettingsBlob,
    constants::ACK_CODE_BUSY,
};
use ajaxbridge_protocol::{AckStatus, ArmTarget, BridgeCodec, Command, Event};
use ajaxbridge_transport::Connector;

use crate::config::EngineConfig;
use crate::correlator::{AckOutcome, Correlator, Resolution, WriteAction};
use crate::dispatcher::{EventClass, classify};
use crate::notify::{Notification, Notifier};
use crate::pairing::{Candidate, PairingSession};
use crate::registry::{DeviceSnapshot, HubSnapshot, Registry, TelemetryOutcome};

/// Request queue depth per hub; operations are short-lived.
const REQUEST_QUEUE: usize = 16;

type Reply<T> = oneshot::Sender<Result<T>>;

/// API requests served by the hub task.
pub(crate) enum HubRequest {
    StartPairing {
        area_hint: Option<String>,
        reply: Reply<Candidate>,
    },
    ConfirmPairing {
        reply: Reply<DeviceSnapshot>,
    },
    CancelPairing {
        reply: Reply<()>,
    },
    RemoveDevice {
        device: DeviceId,
        reply: Reply<()>,
    },
    SetSensitivity {
        device: DeviceId,
        level: SensitivityLevel,
        reply: Reply<DeviceSnapshot>,
    },
    SetZone24h {
        device: DeviceId,
        enabled: bool,
        reply: Reply<DeviceSnapshot>,
    },
    SetArmed {
        target: ArmTarget,
        armed: bool,
        reply: Reply<()>,
    },
    RefreshDevices {
        reply: Reply<Vec<DeviceSnapshot>>,
    },
    SetDebugLogging {
        enabled: bool,
        reply: oneshot::Sender<HubSnapshot>,
    },
    ListDevices {
        reply: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    GetDevice {
        device: DeviceId,
        reply: oneshot::Sender<Option<DeviceSnapshot>>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
}

/// Purpose attached to each pending command; interpreted at resolution.
enum CommandContext {
    /// HubStatus issued right after connect.
    Handshake,
    /// SearchStart for the active pairing session.
    PairingSearch,
    /// Best-effort SearchStop; outcome only logged.
    PairingStop,
    /// Enroll for the confirmed candidate.
    PairingEnroll,
    Unenroll {
        device: DeviceId,
        reply: Reply<()>,
    },
    Arm {
        target: ArmTarget,
        armed: bool,
        reply: Reply<()>,
    },
    Settings {
        device: DeviceId,
        blob: SettingsBlob,
        reply: Reply<DeviceSnapshot>,
    },
    ListRefresh {
        reply: Reply<Vec<DeviceSnapshot>>,
    },
}

/// Active pairing session plus the callers waiting on it.
struct PairingDriver {
    session: PairingSession,
    search_reply: Option<Reply<Candidate>>,
    confirm_reply: Option<Reply<DeviceSnapshot>>,
}

/// Why the connected loop ended.
enum SessionExit {
    /// All handles dropped; the hub is being removed.
    Shutdown,
    LinkLost(String),
}

/// Cloneable client of one hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    hub_id: HubId,
    sender: mpsc::Sender<HubRequest>,
}

impl HubHandle {
    #[must_use]
    pub fn hub_id(&self) -> HubId {
        self.hub_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::UnknownHub)?;
        rx.await
            .map_err(|_| Error::Cancelled("hub session stopped".to_string()))
    }

    /// Begin a pairing search; resolves when a candidate announces itself.
    pub async fn start_pairing(&self, area_hint: Option<String>) -> Result<Candidate> {
        self.request(|reply| HubRequest::StartPairing { area_hint, reply })
            .await?
    }

    /// Confirm the pending candidate; resolves when it is enrolled.
    pub async fn confirm_pairing(&self) -> Result<DeviceSnapshot> {
        self.request(|reply| HubRequest::ConfirmPairing { reply }).await?
    }

    /// Abort the active pairing session, if any.
    pub async fn cancel_pairing(&self) -> Result<()> {
        self.request(|reply| HubRequest::CancelPairing { reply }).await?
    }

    /// Unenroll a device; the registry entry is deleted only on a positive
    /// acknowledgement.
    pub async fn remove_device(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| HubRequest::RemoveDevice { device, reply })
            .await?
    }

    pub async fn set_sensitivity(
        &self,
        device: DeviceId,
        level: SensitivityLevel,
    ) -> Result<DeviceSnapshot> {
        self.request(|reply| HubRequest::SetSensitivity {
            device,
            level,
            reply,
        })
        .await?
    }

    pub async fn set_24h_zone(&self, device: DeviceId, enabled: bool) -> Result<DeviceSnapshot> {
        self.request(|reply| HubRequest::SetZone24h {
            device,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn set_armed(&self, target: ArmTarget, armed: bool) -> Result<()> {
        self.request(|reply| HubRequest::SetArmed {
            target,
            armed,
            reply,
        })
        .await?
    }

    /// Re-read the bridge's paired-device list and reconcile the registry.
    pub async fn refresh_devices(&self) -> Result<Vec<DeviceSnapshot>> {
        self.request(|reply| HubRequest::RefreshDevices { reply }).await?
    }

    pub async fn set_debug_logging(&self, enabled: bool) -> Result<HubSnapshot> {
        self.request(|reply| HubRequest::SetDebugLogging { enabled, reply })
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceSnapshot>> {
        self.request(|reply| HubRequest::ListDevices { reply }).await
    }

    pub async fn get_device(&self, device: DeviceId) -> Result<Option<DeviceSnapshot>> {
        self.request(|reply| HubRequest::GetDevice { device, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        self.request(|reply| HubRequest::Snapshot { reply }).await
    }
}

/// Spawn the owner task for one hub.
pub(crate) fn spawn_hub<C: Connector>(
    hub_id: HubId,
    connector: C,
    config: EngineConfig,
    notifier: Notifier,
) -> (HubHandle, JoinHandle<()>) {
    let (sender, requests) = mpsc::channel(REQUEST_QUEUE);
    let endpoint = connector.describe();

    let session = HubSession {
        hub_id,
        config: config.clone(),
        connector,
        requests,
        registry: Registry::new(hub_id, endpoint),
        notifier,
        correlator: Correlator::new(config.command_timeout),
        pairing: None,
        list_buffer: Vec::new(),
        list_active: false,
        last_rx: Instant::now(),
        decode_errors: 0,
    };

    let join = tokio::spawn(session.run());
    (HubHandle { hub_id, sender }, join)
}

struct HubSession<C: Connector> {
    hub_id: HubId,
    config: EngineConfig,
    connector: C,
    requests: mpsc::Receiver<HubRequest>,
    registry: Registry,
    notifier: Notifier,
    correlator: Correlator<CommandContext>,
    pairing: Option<PairingDriver>,
    /// List entries collected while a DeviceList command is in flight.
    list_buffer: Vec<(DeviceId, u8)>,
    list_active: bool,
    last_rx: Instant,
    decode_errors: u64,
}

impl<C: Connector> HubSession<C> {
    async fn run(mut self) {
        let mut backoff = self.config.reconnect_initial;

        loop {
            let snapshot = self.registry.set_connection(ConnectionState::Connecting);
            self.publish_hub(snapshot);
            info!(hub = %self.hub_id, "connecting");

            match self.connector.connect().await {
                Ok(io) => {
                    backoff = self.config.reconnect_initial;
                    let framed = Framed::new(io, BridgeCodec::new());
                    match self.connected(framed).await {
                        SessionExit::Shutdown => {
                            self.shutdown();
                            return;
                        }
                        SessionExit::LinkLost(reason) => self.on_link_loss(&reason),
                    }
                }
                Err(e) => self.on_link_loss(&e.to_string()),
            }

            // Backoff before reconnecting, still serving snapshot requests.
            let resume_at = Instant::now() + backoff;
            backoff = self.config.next_backoff(backoff);
            loop {
                tokio::select! {
                    request = self.requests.recv() => match request {
                        Some(request) => self.serve_offline(request),
                        None => {
                            self.shutdown();
                            return;
                        }
                    },
                    () = sleep_until(resume_at) => break,
                }
            }
        }
    }

    async fn connected<S>(&mut self, mut framed: Framed<S, BridgeCodec>) -> SessionExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.last_rx = Instant::now();

        // Identify the bridge; the HubState reply flips the hub to Ready.
        if let Err(reason) = self
            .submit(Command::HubStatus, CommandContext::Handshake, &mut framed)
            .await
        {
            return SessionExit::LinkLost(reason);
        }

        loop {
            let command_deadline = self.correlator.deadline();
            let idle_deadline = self
                .correlator
                .has_in_flight()
                .then(|| self.last_rx + self.config.idle_timeout);
            let pairing_deadline = self
                .pairing
                .as_ref()
                .filter(|driver| driver.session.state().is_active())
                .map(|driver| driver.session.deadline());

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(reason) = self.handle_request(request, &mut framed).await {
                            return SessionExit::LinkLost(reason);
                        }
                    }
                    None => return SessionExit::Shutdown,
                },

                event = framed.next() => match event {
                    Some(Ok(event)) => {
                        self.last_rx = Instant::now();
                        if let Err(reason) = self.handle_event(event, &mut framed).await {
                            return SessionExit::LinkLost(reason);
                        }
                    }
                    Some(Err(Error::Io(e))) => {
                        return SessionExit::LinkLost(format!("read failed: {e}"));
                    }
                    Some(Err(e)) => {
                        // Malformed or unknown frame: a diagnostic, never
                        // fatal. The accumulator stays aligned underneath.
                        self.decode_errors += 1;
                        debug!(hub = %self.hub_id, error = %e, total = self.decode_errors,
                               "undecodable frame skipped");
                    }
                    None => return SessionExit::LinkLost("serial stream closed".to_string()),
                },

                () = sleep_until(command_deadline.unwrap_or_else(far_future)),
                        if command_deadline.is_some() => {
                    if let Err(reason) = self.on_command_timeout(&mut framed).await {
                        return SessionExit::LinkLost(reason);
                    }
                }

                () = sleep_until(idle_deadline.unwrap_or_else(far_future)),
                        if idle_deadline.is_some() => {
                    return SessionExit::LinkLost(format!(
                        "no traffic for {:?} with a command outstanding",
                        self.config.idle_timeout
                    ));
                }

                () = sleep_until(pairing_deadline.unwrap_or_else(far_future)),
                        if pairing_deadline.is_some() => {
                    if let Err(reason) = self.on_pairing_window_elapsed(&mut framed).await {
                        return SessionExit::LinkLost(reason);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // API requests
    // ------------------------------------------------------------------

    async fn handle_request<S>(
        &mut self,
        request: HubRequest,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match request {
            HubRequest::StartPairing { area_hint, reply } => {
                if self.pairing_active() {
                    let _ = reply.send(Err(Error::DuplicateOperation));
                    return Ok(());
                }
                if self.list_active {
                    let _ = reply.send(Err(Error::Busy));
                    return Ok(());
                }
                info!(hub = %self.hub_id, "pairing search started");
                self.pairing = Some(PairingDriver {
                    session: PairingSession::start(
                        area_hint,
                        Instant::now() + self.config.pairing_window,
                    ),
                    search_reply: Some(reply),
                    confirm_reply: None,
                });
                self.submit(Command::SearchStart, CommandContext::PairingSearch, framed)
                    .await?;
            }

            HubRequest::ConfirmPairing { reply } => {
                let candidate = match self.pairing.as_mut() {
                    Some(driver) => match driver.session.confirm() {
                        Ok(candidate) => {
                            driver.confirm_reply = Some(reply);
                            candidate
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return Ok(());
                        }
                    },
                    None => {
                        let _ = reply.send(Err(Error::PairingRejected {
                            reason: "no candidate awaiting confirmation".to_string(),
                        }));
                        return Ok(());
                    }
                };
                self.submit(
                    Command::Enroll {
                        device: candidate.device,
                    },
                    CommandContext::PairingEnroll,
                    framed,
                )
                .await?;
            }

            HubRequest::CancelPairing { reply } => {
                if let Some(driver) = self.pairing.take() {
                    info!(hub = %self.hub_id, state = %driver.session.state(), "pairing cancelled");
                    resolve_pairing_waiters(
                        driver,
                        Error::Cancelled("pairing cancelled".to_string()),
                    );
                    self.submit(Command::SearchStop, CommandContext::PairingStop, framed)
                        .await?;
                }
                let _ = reply.send(Ok(()));
            }

            HubRequest::RemoveDevice { device, reply } => {
                if !self.registry.contains(device) {
                    let _ = reply.send(Err(Error::UnknownDevice(device.to_string())));
                    return Ok(());
                }
                if self.pairing_active() {
                    let _ = reply.send(Err(Error::Busy));
                    return Ok(());
                }
                self.submit(
                    Command::Unenroll { device },
                    CommandContext::Unenroll { device, reply },
                    framed,
                )
                .await?;
            }

            HubRequest::SetSensitivity {
                device,
                level,
                reply,
            } => {
                let prepared = self.settings_write(
                    device,
                    |caps| caps.sensitivity,
                    "sensitivity",
                    |blob| blob.with_sensitivity(level),
                );
                match prepared {
                    Ok((command, context)) => {
                        self.submit(command, context_with(context, reply), framed)
                            .await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            HubRequest::SetZone24h {
                device,
                enabled,
                reply,
            } => {
                let prepared = self.settings_write(
                    device,
                    |caps| caps.zone_24h,
                    "24h zone",
                    |blob| blob.with_zone_24h(enabled),
                );
                match prepared {
                    Ok((command, context)) => {
                        self.submit(command, context_with(context, reply), framed)
                            .await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            HubRequest::SetArmed {
                target,
                armed,
                reply,
            } => {
                if let ArmTarget::Device(device) = target {
                    match self.registry.get_device(device) {
                        None => {
                            let _ = reply.send(Err(Error::UnknownDevice(device.to_string())));
                            return Ok(());
                        }
                        Some(snapshot) if !snapshot.capabilities.armable => {
                            let _ = reply.send(Err(Error::UnsupportedCapability {
                                capability: "arming",
                            }));
                            return Ok(());
                        }
                        Some(_) => {}
                    }
                }
                self.submit(
                    Command::SetArmed { target, armed },
                    CommandContext::Arm {
                        target,
                        armed,
                        reply,
                    },
                    framed,
                )
                .await?;
            }

            HubRequest::RefreshDevices { reply } => {
                if self.list_active {
                    let _ = reply.send(Err(Error::DuplicateOperation));
                    return Ok(());
                }
                if self.pairing_active() {
                    let _ = reply.send(Err(Error::Busy));
                    return Ok(());
                }
                self.list_buffer.clear();
                self.list_active = true;
                self.submit(
                    Command::DeviceList,
                    CommandContext::ListRefresh { reply },
                    framed,
                )
                .await?;
            }

            HubRequest::SetDebugLogging { enabled, reply } => {
                let snapshot = self.registry.set_debug_logging(enabled);
                info!(hub = %self.hub_id, enabled, "debug frame logging toggled");
                self.publish_hub(snapshot.clone());
                let _ = reply.send(snapshot);
            }

            HubRequest::ListDevices { reply } => {
                let _ = reply.send(self.registry.list_devices());
            }
            HubRequest::GetDevice { device, reply } => {
                let _ = reply.send(self.registry.get_device(device));
            }
            HubRequest::Snapshot { reply } => {
                let _ = reply.send(self.registry.hub_snapshot());
            }
        }
        Ok(())
    }

    /// Serve what can be served without a link; refuse the rest.
    fn serve_offline(&mut self, request: HubRequest) {
        let offline = || Error::LinkLost("hub is not connected".to_string());
        match request {
            HubRequest::ListDevices { reply } => {
                let _ = reply.send(self.registry.list_devices());
            }
            HubRequest::GetDevice { device, reply } => {
                let _ = reply.send(self.registry.get_device(device));
            }
            HubRequest::Snapshot { reply } => {
                let _ = reply.send(self.registry.hub_snapshot());
            }
            HubRequest::SetDebugLogging { enabled, reply } => {
                let snapshot = self.registry.set_debug_logging(enabled);
                self.publish_hub(snapshot.clone());
                let _ = reply.send(snapshot);
            }
            HubRequest::StartPairing { reply, .. } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::ConfirmPairing { reply } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::CancelPairing { reply } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::RemoveDevice { reply, .. } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::SetSensitivity { reply, .. } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::SetZone24h { reply, .. } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::SetArmed { reply, .. } => {
                let _ = reply.send(Err(offline()));
            }
            HubRequest::RefreshDevices { reply } => {
                let _ = reply.send(Err(offline()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Decoded frames
    // ------------------------------------------------------------------

    async fn handle_event<S>(
        &mut self,
        event: Event,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.registry.debug_logging() {
            debug!(hub = %self.hub_id, ?event, "rx");
        } else {
            trace!(hub = %self.hub_id, ?event, "rx");
        }

        match classify(&event) {
            EventClass::CommandResponse => {
                let Event::Ack {
                    status,
                    code,
                    command,
                } = event
                else {
                    unreachable!("classified as response");
                };
                let (resolution, action) =
                    self.correlator.on_ack(command, AckOutcome { status, code });
                self.perform(action, framed).await?;
                if let Some(resolution) = resolution {
                    self.apply_resolution(resolution, framed).await?;
                }
            }

            EventClass::Telemetry => {
                let Event::Status(report) = event else {
                    unreachable!("classified as telemetry");
                };
                match self.registry.apply_telemetry(&report) {
                    TelemetryOutcome::Updated(device) => {
                        self.notifier.publish(Notification::DeviceUpdated {
                            hub_id: self.hub_id,
                            device,
                        });
                    }
                    TelemetryOutcome::UnknownDevice => {
                        self.notifier.publish(Notification::UnknownDeviceTelemetry {
                            hub_id: self.hub_id,
                            device_id: report.device,
                        });
                    }
                    TelemetryOutcome::Placeholder => {}
                }
            }

            EventClass::PairingAnnounce => {
                let Event::Announce {
                    device,
                    type_code,
                    firmware,
                    new,
                    awaiting_confirm,
                } = event
                else {
                    unreachable!("classified as announce");
                };
                self.handle_announce(device, type_code, firmware, new, awaiting_confirm);
            }

            EventClass::StatusChange => match event {
                Event::Alarm { device, code, .. } => {
                    if self.registry.contains(device) {
                        self.notifier.publish(Notification::Alarm {
                            hub_id: self.hub_id,
                            device_id: device,
                            code,
                        });
                    } else {
                        self.registry.record_unknown_device(device);
                        self.notifier.publish(Notification::UnknownDeviceTelemetry {
                            hub_id: self.hub_id,
                            device_id: device,
                        });
                    }
                }
                Event::HubState {
                    code,
                    firmware,
                    registered,
                    online,
                    noise_dbm,
                    armed,
                } => {
                    self.registry
                        .set_hub_state(code, firmware, registered, online, noise_dbm, armed);
                    if self.registry.connection() == ConnectionState::Connecting {
                        info!(hub = %self.hub_id, bridge = %code, firmware = %firmware, "bridge ready");
                        self.registry.set_connection(ConnectionState::Ready);
                    }
                    self.publish_hub(self.registry.hub_snapshot());
                }
                _ => unreachable!("classified as status change"),
            },

            EventClass::DeviceList => {
                let Event::ListEntry { device, type_code, .. } = event else {
                    unreachable!("classified as list entry");
                };
                if self.list_active {
                    self.list_buffer.push((device, type_code));
                } else {
                    debug!(hub = %self.hub_id, device = %device, "stray list entry");
                }
            }
        }
        Ok(())
    }

    fn handle_announce(
        &mut self,
        device: DeviceId,
        type_code: u8,
        firmware: ajaxbridge_core::FirmwareVersion,
        new: bool,
        awaiting_confirm: bool,
    ) {
        if self.registry.contains(device) {
            // Already enrolled: a re-announce is status noise, not a
            // candidate.
            debug!(hub = %self.hub_id, device = %device, "announce for known device");
            return;
        }

        let Some(driver) = self.pairing.as_mut() else {
            debug!(hub = %self.hub_id, device = %device, "announce outside pairing");
            return;
        };

        let Ok(device_type) = DeviceType::from_code(type_code) else {
            warn!(hub = %self.hub_id, device = %device, type_code,
                  "announce with unsupported device type");
            return;
        };

        if let Some(candidate) =
            driver
                .session
                .observe_announce(device, device_type, firmware, new, awaiting_confirm)
        {
            info!(
                hub = %self.hub_id,
                device = %candidate.device,
                model = %candidate.device_type,
                "pairing candidate found"
            );
            if let Some(reply) = driver.search_reply.take() {
                let _ = reply.send(Ok(candidate));
            }
        }
    }

    // ------------------------------------------------------------------
    // Command resolutions
    // ------------------------------------------------------------------

    async fn apply_resolution<S>(
        &mut self,
        resolution: Resolution<CommandContext>,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match resolution {
            Resolution::Acked { context, outcome } => {
                self.apply_ack(context, outcome, framed).await?;
            }
            Resolution::TimedOut { context } => {
                self.apply_timeout(context, framed).await?;
            }
            Resolution::Cancelled { context } => {
                resolve_cancelled(context);
            }
        }
        Ok(())
    }

    async fn apply_ack<S>(
        &mut self,
        context: CommandContext,
        outcome: AckOutcome,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ok = outcome.status == AckStatus::Ok;
        match context {
            CommandContext::Handshake => {
                if !ok {
                    warn!(hub = %self.hub_id, code = outcome.code, "bridge refused status query");
                }
            }

            CommandContext::PairingSearch => {
                if ok {
                    debug!(hub = %self.hub_id, "bridge entered discovery mode");
                } else if let Some(driver) = self.pairing.take() {
                    warn!(hub = %self.hub_id, code = outcome.code, "search refused");
                    resolve_pairing_waiters(driver, nak_error(outcome, "search refused"));
                }
            }

            CommandContext::PairingStop => {
                if !ok {
                    debug!(hub = %self.hub_id, code = outcome.code, "search stop refused");
                }
            }

            CommandContext::PairingEnroll => {
                let Some(mut driver) = self.pairing.take() else {
                    return Ok(());
                };
                if ok {
                    match driver.session.enrolled() {
                        Ok(candidate) => {
                            let snapshot = self.registry.upsert_device(
                                candidate.device,
                                candidate.device_type,
                                candidate.area.clone(),
                            );
                            info!(
                                hub = %self.hub_id,
                                device = %snapshot.id,
                                model = %snapshot.device_type,
                                "device enrolled"
                            );
                            self.notifier.publish(Notification::DeviceAdded {
                                hub_id: self.hub_id,
                                device: snapshot.clone(),
                            });
                            if let Some(reply) = driver.confirm_reply.take() {
                                let _ = reply.send(Ok(snapshot));
                            }
                        }
                        Err(e) => {
                            resolve_pairing_waiters(driver, e);
                        }
                    }
                } else {
                    driver.session.fail();
                    warn!(hub = %self.hub_id, code = outcome.code, "enrollment refused");
                    resolve_pairing_waiters(driver, nak_error(outcome, "enrollment refused"));
                }
                // Leave discovery mode either way.
                self.submit(Command::SearchStop, CommandContext::PairingStop, framed)
                    .await?;
            }

            CommandContext::Unenroll { device, reply } => {
                if ok {
                    match self.registry.remove_device(device) {
                        Ok(()) => {
                            info!(hub = %self.hub_id, device = %device, "device removed");
                            self.notifier.publish(Notification::DeviceRemoved {
                                hub_id: self.hub_id,
                                device_id: device,
                            });
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                } else {
                    let _ = reply.send(Err(nak_error(outcome, "removal refused")));
                }
            }

            CommandContext::Arm {
                target,
                armed,
                reply,
            } => {
                if ok {
                    let armed_state = ArmedState::from_flag(armed);
                    match target {
                        ArmTarget::Hub => {
                            let snapshot = self.registry.set_hub_armed(armed_state);
                            self.publish_hub(snapshot);
                        }
                        ArmTarget::Device(device) => {
                            if let Ok(snapshot) =
                                self.registry.set_device_armed(device, armed_state)
                            {
                                self.notifier.publish(Notification::DeviceUpdated {
                                    hub_id: self.hub_id,
                                    device: snapshot,
                                });
                            }
                        }
                    }
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(nak_error(outcome, "arm command refused")));
                }
            }

            CommandContext::Settings {
                device,
                blob,
                reply,
            } => {
                if ok {
                    match self.registry.apply_settings(device, blob) {
                        Ok(snapshot) => {
                            self.notifier.publish(Notification::DeviceUpdated {
                                hub_id: self.hub_id,
                                device: snapshot.clone(),
                            });
                            let _ = reply.send(Ok(snapshot));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                } else {
                    let _ = reply.send(Err(nak_error(outcome, "settings write refused")));
                }
            }

            CommandContext::ListRefresh { reply } => {
                self.list_active = false;
                if ok {
                    let listed: Vec<(DeviceId, DeviceType)> = self
                        .list_buffer
                        .drain(..)
                        .filter_map(|(device, type_code)| {
                            match DeviceType::from_code(type_code) {
                                Ok(device_type) => Some((device, device_type)),
                                Err(_) => {
                                    warn!(hub = %self.hub_id, device = %device, type_code,
                                          "listed device has unsupported type");
                                    None
                                }
                            }
                        })
                        .collect();
                    let (added, removed) = self.registry.reconcile(&listed);
                    for device in added {
                        self.notifier.publish(Notification::DeviceAdded {
                            hub_id: self.hub_id,
                            device,
                        });
                    }
                    for device_id in removed {
                        self.notifier.publish(Notification::DeviceRemoved {
                            hub_id: self.hub_id,
                            device_id,
                        });
                    }
                    let _ = reply.send(Ok(self.registry.list_devices()));
                } else {
                    self.list_buffer.clear();
                    let _ = reply.send(Err(nak_error(outcome, "device list refused")));
                }
            }
        }
        Ok(())
    }

    async fn apply_timeout<S>(
        &mut self,
        context: CommandContext,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = Error::CommandTimeout {
            timeout_ms: self.config.command_timeout.as_millis() as u64,
        };
        match context {
            CommandContext::Handshake => {
                // Retries exhausted on an idempotent query right after
                // connect: the link is not answering at all.
                return Err("bridge did not answer the handshake".to_string());
            }
            CommandContext::PairingSearch => {
                if let Some(driver) = self.pairing.take() {
                    resolve_pairing_waiters(driver, timeout);
                }
            }
            CommandContext::PairingStop => {
                debug!(hub = %self.hub_id, "search stop unacknowledged");
            }
            CommandContext::PairingEnroll => {
                if let Some(mut driver) = self.pairing.take() {
                    driver.session.fail();
                    resolve_pairing_waiters(driver, timeout);
                }
                self.submit(Command::SearchStop, CommandContext::PairingStop, framed)
                    .await?;
            }
            // Non-idempotent operations surface the timeout to the caller
            // and leave the registry untouched; re-issuing is their call.
            CommandContext::Unenroll { reply, .. } => {
                let _ = reply.send(Err(timeout));
            }
            CommandContext::Arm { reply, .. } => {
                let _ = reply.send(Err(timeout));
            }
            CommandContext::Settings { reply, .. } => {
                let _ = reply.send(Err(timeout));
            }
            CommandContext::ListRefresh { reply } => {
                self.list_active = false;
                self.list_buffer.clear();
                let _ = reply.send(Err(timeout));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers, link loss, shutdown
    // ------------------------------------------------------------------

    async fn on_command_timeout<S>(
        &mut self,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (resolution, action) = self.correlator.on_timeout();
        self.perform(action, framed).await?;
        if let Some(resolution) = resolution {
            self.apply_resolution(resolution, framed).await?;
        }
        Ok(())
    }

    async fn on_pairing_window_elapsed<S>(
        &mut self,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(mut driver) = self.pairing.take() {
            warn!(hub = %self.hub_id, state = %driver.session.state(), "pairing window elapsed");
            driver.session.timed_out();
            resolve_pairing_waiters(driver, Error::PairingTimeout);
            // Best effort; the bridge drops out of discovery on its own
            // timer as well.
            self.submit(Command::SearchStop, CommandContext::PairingStop, framed)
                .await?;
        }
        Ok(())
    }

    fn on_link_loss(&mut self, reason: &str) {
        warn!(hub = %self.hub_id, reason, "link lost");
        let snapshot = self.registry.set_connection(ConnectionState::Error);
        self.publish_hub(snapshot);

        for resolution in self.correlator.cancel_all() {
            if let Resolution::Cancelled { context } = resolution {
                resolve_cancelled(context);
            }
        }
        if let Some(driver) = self.pairing.take() {
            resolve_pairing_waiters(driver, Error::LinkLost(reason.to_string()));
        }
        self.list_active = false;
        self.list_buffer.clear();
    }

    fn shutdown(&mut self) {
        info!(hub = %self.hub_id, "hub removed, shutting down session");
        for resolution in self.correlator.cancel_all() {
            if let Resolution::Cancelled { context } = resolution {
                resolve_cancelled(context);
            }
        }
        if let Some(driver) = self.pairing.take() {
            resolve_pairing_waiters(driver, Error::Cancelled("hub removed".to_string()));
        }
        let snapshot = self.registry.set_connection(ConnectionState::Disconnected);
        self.publish_hub(snapshot);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn pairing_active(&self) -> bool {
        self.pairing
            .as_ref()
            .is_some_and(|driver| driver.session.state().is_active())
    }

    fn settings_write(
        &mut self,
        device: DeviceId,
        capable: impl FnOnce(&ajaxbridge_core::Capabilities) -> bool,
        capability: &'static str,
        update: impl FnOnce(&SettingsBlob) -> Result<SettingsBlob>,
    ) -> Result<(Command, (DeviceId, SettingsBlob))> {
        let snapshot = self
            .registry
            .get_device(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;
        if !capable(&snapshot.capabilities) {
            return Err(Error::UnsupportedCapability { capability });
        }
        // Writes require a previously observed blob so the undocumented
        // bytes go back out unchanged.
        let blob = snapshot.settings.as_ref().ok_or(Error::SettingsUnknown)?;
        let updated = update(blob)?;
        let command = Command::WriteSettings {
            device,
            settings: updated.as_bytes().to_vec(),
        };
        Ok((command, (device, updated)))
    }

    async fn submit<S>(
        &mut self,
        command: Command,
        context: CommandContext,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let action = self.correlator.submit(command, context);
        self.perform(action, framed).await
    }

    async fn perform<S>(
        &mut self,
        action: WriteAction,
        framed: &mut Framed<S, BridgeCodec>,
    ) -> std::result::Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let WriteAction::Send(command) = action {
            if self.registry.debug_logging() {
                debug!(hub = %self.hub_id, ?command, "tx");
            } else {
                trace!(hub = %self.hub_id, ?command, "tx");
            }
            framed
                .send(command)
                .await
                .map_err(|e| format!("write failed: {e}"))?;
        }
        Ok(())
    }

    fn publish_hub(&self, hub: HubSnapshot) {
        self.notifier.publish(Notification::HubUpdated { hub });
    }
}

fn context_with(
    (device, blob): (DeviceId, SettingsBlob),
    reply: Reply<DeviceSnapshot>,
) -> CommandContext {
    CommandContext::Settings {
        device,
        blob,
        reply,
    }
}

/// Error for a NAK ack: busy code maps to `Busy`, anything else to a
/// rejection carrying the detail code.
fn nak_error(outcome: AckOutcome, what: &str) -> Error {
    if outcome.code == ACK_CODE_BUSY {
        Error::Busy
    } else {
        Error::PairingRejected {
            reason: format!("{what} (code {})", outcome.code),
        }
    }
}

fn resolve_pairing_waiters(mut driver: PairingDriver, error: Error) {
    if !driver.session.state().is_terminal() {
        driver.session.fail();
    }
    if let Some(reply) = driver.search_reply.take() {
        let _ = reply.send(Err(clone_error(&error)));
    }
    if let Some(reply) = driver.confirm_reply.take() {
        let _ = reply.send(Err(error));
    }
}

fn resolve_cancelled(context: CommandContext) {
    let cancelled = || Error::Cancelled("link lost".to_string());
    match context {
        CommandContext::Handshake
        | CommandContext::PairingSearch
        | CommandContext::PairingStop
        | CommandContext::PairingEnroll => {}
        CommandContext::Unenroll { reply, .. } => {
            let _ = reply.send(Err(cancelled()));
        }
        CommandContext::Arm { reply, .. } => {
            let _ = reply.send(Err(cancelled()));
        }
        CommandContext::Settings { reply, .. } => {
            let _ = reply.send(Err(cancelled()));
        }
        CommandContext::ListRefresh { reply } => {
            let _ = reply.send(Err(cancelled()));
        }
    }
}

/// Shallow clone for fanning one error out to two waiters.
fn clone_error(error: &Error) -> Error {
    match error {
        Error::CommandTimeout { timeout_ms } => Error::CommandTimeout {
            timeout_ms: *timeout_ms,
        },
        Error::PairingTimeout => Error::PairingTimeout,
        Error::PairingRejected { reason } => Error::PairingRejected {
            reason: reason.clone(),
        },
        Error::Busy => Error::Busy,
        Error::LinkLost(reason) => Error::LinkLost(reason.clone()),
        Error::Cancelled(reason) => Error::Cancelled(reason.clone()),
        other => Error::Cancelled(other.to_string()),
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
