//! The GT06 client session: a single persistent TCP connection that
//! logs in, heart-beats, reports location and status, correlates server
//! acknowledgements and dispatches server commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::FrameCodec;
use crate::correlator::Correlator;
use crate::error::{Gt06Error, Result};
use crate::msg::{
    self, CommandReport, DeviceStatus, LbsCell, LocationFix, LocationReport,
    LocationStatusReport, Login, ServerCommand, StatusReport,
};
use crate::serial::SerialNo;
use crate::{CompleteFrame, Frame};

/// Session construction parameters.
#[derive(Clone, Debug)]
pub struct Gt06Config {
    /// Server ip address or domain name.
    pub server: String,
    pub port: u16,
    /// How long to wait for a server acknowledgement.
    pub timeout: Duration,
    /// Extra connect attempts after the first failure.
    pub retry_count: u32,
    /// Heart-beat period.
    pub life_time: Duration,
    /// One-shot delay before the power-restart hook fires once connect
    /// retries are exhausted.
    pub restart_delay: Duration,
}

impl Gt06Config {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            timeout: Duration::from_secs(5),
            retry_count: 3,
            life_time: Duration::from_secs(180),
            restart_delay: Duration::from_secs(1200),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Lifecycle of a [Gt06] session.
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    LoggedIn,
    /// Connect retries were exhausted and the power-restart timer is
    /// armed.
    RestartPending,
    Closed,
}

/// Callback invoked on its own task for every server-originated 0x80
/// command.
pub type CommandCallback = Arc<dyn Fn(ServerCommand) + Send + Sync>;

/// Hook invoked when the power-restart timer fires. The power-cycle
/// mechanism itself lives outside this crate.
pub type PowerRestartHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heart_beat: Option<JoinHandle<()>>,
    power_restart: Option<JoinHandle<()>>,
}

fn abort_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

struct Inner {
    config: Gt06Config,
    serial: SerialNo,
    state: Mutex<SessionState>,
    writer: AsyncMutex<Option<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
    correlator: Correlator,
    device_status: Mutex<DeviceStatus>,
    callback: Mutex<Option<CommandCallback>>,
    power_hook: Mutex<Option<PowerRestartHook>>,
    heart_beat_defer: Notify,
    tasks: Mutex<Tasks>,
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::LoggedIn
        )
    }

    /// Write one frame, then await its acknowledgement when the frame
    /// kind carries one. The write path serializes outbound frames.
    async fn send_frame(&self, frame: Frame, ack_proto: Option<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Gt06Error::NotConnected);
        }
        let serial = frame.serial;
        debug!(
            "sending frame {:#04X} serial {serial}",
            frame.protocol_no
        );
        {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(Gt06Error::NotConnected)?;
            writer.send(frame).await?;
        }
        // User traffic defers the next heart-beat by a full period.
        self.heart_beat_defer.notify_waiters();

        if let Some(protocol_no) = ack_proto {
            self.correlator
                .wait(protocol_no, serial, self.config.timeout)
                .await?;
        }
        Ok(())
    }

    async fn report_device_status(&self) -> Result<()> {
        let status = *self.device_status.lock().unwrap();
        let payload = StatusReport { status }.encode()?;
        let frame = Frame::new(msg::PROTO_STATUS, self.serial.next(), payload);
        self.send_frame(frame, Some(msg::PROTO_STATUS)).await
    }
}

/// A GT06 protocol client over a single TCP connection.
///
/// The session exclusively owns its socket, timers, reader task and
/// correlation map; everything stops when the session is dropped.
pub struct Gt06 {
    inner: Arc<Inner>,
}

impl Gt06 {
    pub fn new(config: Gt06Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                serial: SerialNo::new(),
                state: Mutex::new(SessionState::Idle),
                writer: AsyncMutex::new(None),
                correlator: Correlator::new(),
                device_status: Mutex::new(DeviceStatus::default()),
                callback: Mutex::new(None),
                power_hook: Mutex::new(None),
                heart_beat_defer: Notify::new(),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Register the callback dispatched for server-originated 0x80
    /// command frames. Replaces any previous callback atomically.
    pub fn set_callback(&self, callback: impl Fn(ServerCommand) + Send + Sync + 'static) {
        *self.inner.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Register the external power-cycle mechanism invoked when the
    /// restart timer fires.
    pub fn set_power_restart_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.power_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Replace the device status reported by heart-beats and 0x16
    /// location reports.
    pub fn set_device_status(&self, status: DeviceStatus) -> Result<()> {
        status.validate()?;
        *self.inner.device_status.lock().unwrap() = status;
        Ok(())
    }

    /// Whether the one-shot power-restart timer is armed.
    pub fn restart_pending(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .power_restart
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Connect to the server, retrying up to `retry_count` extra times.
    ///
    /// Success cancels any pending power restart, stops heart-beats
    /// until the next login and starts the reader task. Exhausted
    /// retries arm the power-restart timer instead of failing fatally.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.set_state(SessionState::Connecting);

        let attempts = inner.config.retry_count + 1;
        for attempt in 1..=attempts {
            match TcpStream::connect((inner.config.server.as_str(), inner.config.port)).await {
                Ok(stream) => {
                    info!(
                        "connected to {}:{} on attempt {attempt}",
                        inner.config.server, inner.config.port
                    );
                    // Retire the previous connection's tasks before any
                    // new state is installed; a stale reader must not
                    // outlive its socket.
                    let stale = {
                        let mut tasks = inner.tasks.lock().unwrap();
                        [
                            tasks.power_restart.take(),
                            tasks.heart_beat.take(),
                            tasks.reader.take(),
                        ]
                    };
                    for task in stale.into_iter().flatten() {
                        task.abort();
                        let _ = task.await;
                    }
                    inner.correlator.reset();

                    let (read_half, write_half) = stream.into_split();
                    *inner.writer.lock().await =
                        Some(FramedWrite::new(write_half, FrameCodec::new()));
                    let reader = tokio::spawn(read_loop(self.inner.clone(), read_half));
                    inner.tasks.lock().unwrap().reader = Some(reader);

                    inner.set_state(SessionState::Connected);
                    return Ok(());
                }
                Err(error) => {
                    warn!("connect attempt {attempt}/{attempts} failed: {error}");
                }
            }
        }

        inner.set_state(SessionState::RestartPending);
        let timer = tokio::spawn(power_restart_timer(self.inner.clone()));
        inner.tasks.lock().unwrap().power_restart = Some(timer);
        Err(Gt06Error::ConnectFailed(attempts))
    }

    /// Log in with the device IMEI and start the heart-beat timer on
    /// acknowledgement.
    pub async fn login(&self, imei: &str) -> Result<()> {
        let payload = Login {
            imei: imei.to_owned(),
        }
        .encode()?;
        let frame = Frame::new(msg::PROTO_LOGIN, self.inner.serial.next(), payload);
        self.inner.send_frame(frame, Some(msg::PROTO_LOGIN)).await?;

        self.inner.set_state(SessionState::LoggedIn);
        let beat = tokio::spawn(heart_beat_loop(self.inner.clone()));
        let mut tasks = self.inner.tasks.lock().unwrap();
        abort_task(&mut tasks.heart_beat);
        tasks.heart_beat = Some(beat);
        Ok(())
    }

    /// Report a GPS fix and the serving cell. With
    /// `include_device_status` the report goes out as an acknowledged
    /// 0x16 frame; without it as a fire-and-forget 0x12 frame that
    /// returns on send success.
    pub async fn report_location(
        &self,
        fix: &LocationFix,
        cell: &LbsCell,
        include_device_status: bool,
    ) -> Result<()> {
        if include_device_status {
            let status = *self.inner.device_status.lock().unwrap();
            let payload = LocationStatusReport {
                fix: *fix,
                cell: *cell,
                status,
            }
            .encode()?;
            let frame = Frame::new(
                msg::PROTO_LOCATION_STATUS,
                self.inner.serial.next(),
                payload,
            );
            self.inner
                .send_frame(frame, Some(msg::PROTO_LOCATION_STATUS))
                .await
        } else {
            let payload = LocationReport {
                fix: *fix,
                cell: *cell,
            }
            .encode()?;
            let frame = Frame::new(msg::PROTO_LOCATION, self.inner.serial.next(), payload);
            self.inner.send_frame(frame, None).await
        }
    }

    /// Report the stored device status and await the heart-beat
    /// acknowledgement.
    pub async fn report_device_status(&self) -> Result<()> {
        self.inner.report_device_status().await
    }

    /// Respond to a server command. `server_flag` echoes the flag of
    /// the command being answered; no acknowledgement is awaited.
    pub async fn report_device_cmd(&self, server_flag: u32, cmd_data: &str) -> Result<()> {
        let payload = CommandReport {
            server_flag,
            cmd_data: cmd_data.to_owned(),
        }
        .encode()?;
        let frame = Frame::new(msg::PROTO_DEVICE_CMD, self.inner.serial.next(), payload);
        self.inner.send_frame(frame, None).await
    }

    /// Orderly shutdown: stop the reader and heart-beat tasks, close
    /// the socket and wake every waiter.
    pub async fn disconnect(&self) -> Result<()> {
        let stale = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            [tasks.reader.take(), tasks.heart_beat.take()]
        };
        for task in stale.into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.inner.set_state(SessionState::Closed);
        self.inner.correlator.close();
        Ok(())
    }
}

impl Drop for Gt06 {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        abort_task(&mut tasks.reader);
        abort_task(&mut tasks.heart_beat);
        abort_task(&mut tasks.power_restart);
    }
}

/// Reader task: re-frame the inbound byte stream, hand 0x80 commands to
/// the callback and everything else to the correlator. Exits when the
/// socket closes or fails; the session then reads as [SessionState::Closed].
async fn read_loop(inner: Arc<Inner>, read_half: OwnedReadHalf) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    while let Some(item) = frames.next().await {
        match item {
            Ok(CompleteFrame::Valid(frame)) => dispatch(&inner, frame),
            Ok(CompleteFrame::Invalid(reason)) => {
                warn!("discarding inbound frame: {reason}");
            }
            Err(reason) => {
                error!("read failed: {reason}");
                break;
            }
        }
    }

    info!(
        "connection to {}:{} closed",
        inner.config.server, inner.config.port
    );
    inner.set_state(SessionState::Closed);
    *inner.writer.lock().await = None;
    inner.correlator.close();
}

fn dispatch(inner: &Arc<Inner>, frame: Frame) {
    debug!(
        "inbound frame {:#04X} serial {}",
        frame.protocol_no, frame.serial
    );
    if frame.protocol_no == msg::PROTO_SERVER_CMD {
        let command = match ServerCommand::decode(&frame.payload) {
            Ok(command) => command,
            Err(reason) => {
                warn!("malformed server command: {reason}");
                return;
            }
        };
        let callback = inner.callback.lock().unwrap().clone();
        match callback {
            // A slow callback must not stall the reader.
            Some(callback) => {
                tokio::spawn(async move { callback(command) });
            }
            None => warn!("{}", Gt06Error::CallbackMissing),
        }
    } else {
        inner.correlator.deliver(frame);
    }
}

/// Heart-beat task: report the device status every `life_time`, with
/// any outbound traffic restarting the period.
async fn heart_beat_loop(inner: Arc<Inner>) {
    loop {
        let deferred = inner.heart_beat_defer.notified();
        tokio::pin!(deferred);
        tokio::select! {
            _ = tokio::time::sleep(inner.config.life_time) => {
                if !inner.is_connected() {
                    break;
                }
                if let Err(reason) = inner.report_device_status().await {
                    warn!("heart beat failed: {reason}");
                }
            }
            _ = &mut deferred => {}
        }
    }
}

/// One-shot timer armed by exhausted connect retries; a later
/// successful connect aborts it.
async fn power_restart_timer(inner: Arc<Inner>) {
    tokio::time::sleep(inner.config.restart_delay).await;
    warn!("connect retries exhausted; requesting device power restart");
    let hook = inner.power_hook.lock().unwrap().clone();
    if let Some(hook) = hook {
        hook();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Decoder;

    use crate::msg::{Alarm, DateTime};

    fn test_config(port: u16) -> Gt06Config {
        Gt06Config {
            timeout: Duration::from_secs(1),
            life_time: Duration::from_millis(200),
            ..Gt06Config::new("127.0.0.1", port)
        }
    }

    fn test_status() -> DeviceStatus {
        DeviceStatus {
            defend: true,
            acc: true,
            alarm: Alarm::Vibration,
            gps: true,
            voltage_level: 5,
            gsm_signal: 4,
            ..Default::default()
        }
    }

    fn test_fix() -> LocationFix {
        LocationFix {
            date_time: DateTime {
                year: 22,
                month: 7,
                day: 7,
                hour: 16,
                minute: 43,
                second: 53,
            },
            satellite_num: 12,
            latitude: 31.824845156501,
            longitude: 117.24091089413,
            speed: 120,
            course: 126,
            lat_ns: true,
            lon_ew: false,
            gps_onoff: true,
            is_real_time: true,
        }
    }

    fn test_cell() -> LbsCell {
        LbsCell {
            mcc: 460,
            mnc: 0,
            lac: 0x1234,
            cell_id: 0x00ABCD,
        }
    }

    async fn read_frame(socket: &mut TcpStream) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        loop {
            if let Some(item) = codec.decode(&mut buffer).unwrap() {
                match item {
                    CompleteFrame::Valid(frame) => return frame,
                    CompleteFrame::Invalid(reason) => {
                        panic!("invalid frame from client: {reason}")
                    }
                }
            }
            let mut chunk = [0_u8; 256];
            let count = socket.read(&mut chunk).await.unwrap();
            assert!(count > 0, "client closed the connection early");
            buffer.extend_from_slice(&chunk[..count]);
        }
    }

    async fn send_ack(socket: &mut TcpStream, protocol_no: u8, serial: u16) {
        let bytes = Frame::new(protocol_no, serial, vec![]).encode().unwrap();
        socket.write_all(&bytes).await.unwrap();
    }

    async fn spawn_server<F, Fut>(server: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            server(socket).await;
        });
        (port, handle)
    }

    #[tokio::test]
    async fn login_receives_ack_then_heart_beats_flow() {
        let (port, server) = spawn_server(|mut socket| async move {
            let login = read_frame(&mut socket).await;
            assert_eq!(login.protocol_no, msg::PROTO_LOGIN);
            assert_eq!(login.payload, b"0353413532150362");
            send_ack(&mut socket, msg::PROTO_LOGIN, login.serial).await;

            // The heart beat arrives without further prompting.
            let beat = read_frame(&mut socket).await;
            assert_eq!(beat.protocol_no, msg::PROTO_STATUS);
            assert_eq!(beat.payload, [0x4B, 0x05, 0x04, 0x01, 0x02]);
            send_ack(&mut socket, msg::PROTO_STATUS, beat.serial).await;
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.set_device_status(test_status()).unwrap();

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.login("0353413532150362").await.unwrap();
        assert_eq!(session.state(), SessionState::LoggedIn);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn location_report_without_status_returns_on_send() {
        let (port, server) = spawn_server(|mut socket| async move {
            let report = read_frame(&mut socket).await;
            assert_eq!(report.protocol_no, msg::PROTO_LOCATION);
            assert_eq!(report.payload.len(), 26);
            // No acknowledgement on purpose.
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.connect().await.unwrap();

        session
            .report_location(&test_fix(), &test_cell(), false)
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn location_report_with_status_awaits_ack() {
        let (port, server) = spawn_server(|mut socket| async move {
            let report = read_frame(&mut socket).await;
            assert_eq!(report.protocol_no, msg::PROTO_LOCATION_STATUS);
            assert_eq!(report.payload.len(), 32);
            send_ack(&mut socket, msg::PROTO_LOCATION_STATUS, report.serial).await;
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.set_device_status(test_status()).unwrap();
        session.connect().await.unwrap();

        session
            .report_location(&test_fix(), &test_cell(), true)
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_ack_serial_times_out() {
        let (port, server) = spawn_server(|mut socket| async move {
            let beat = read_frame(&mut socket).await;
            // Acknowledge the wrong serial.
            send_ack(&mut socket, msg::PROTO_STATUS, beat.serial + 1).await;
            // Hold the socket open until the client gives up.
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.set_device_status(test_status()).unwrap();
        session.connect().await.unwrap();

        let result = session.report_device_status().await;
        assert!(matches!(result, Err(Gt06Error::AckTimeout(_))));

        server.abort();
    }

    #[tokio::test]
    async fn server_command_dispatches_callback_exactly_once() {
        let expected = ServerCommand {
            server_flag: 0x3039,
            cmd_data: "DYD=OK".into(),
        };

        let payload = expected.encode().unwrap();
        let (port, server) = spawn_server(move |mut socket| async move {
            let bytes = Frame::new(msg::PROTO_SERVER_CMD, 0x0001, payload)
                .encode()
                .unwrap();
            socket.write_all(&bytes).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let session = Gt06::new(test_config(port));
        session.set_callback(move |command| {
            sender.send(command).unwrap();
        });
        session.connect().await.unwrap();

        let command = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("callback never fired")
            .unwrap();
        assert_eq!(command, expected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(receiver.try_recv().is_err(), "callback fired twice");

        server.abort();
    }

    #[tokio::test]
    async fn exhausted_retries_arm_the_restart_timer() {
        // Reserve a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = Gt06::new(test_config(addr.port()));

        let result = session.connect().await;
        assert!(matches!(result, Err(Gt06Error::ConnectFailed(4))));
        assert_eq!(session.state(), SessionState::RestartPending);
        assert!(session.restart_pending());

        // A successful reconnect cancels the pending restart.
        let _listener = TcpListener::bind(addr).await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.restart_pending());
    }

    #[tokio::test]
    async fn restart_hook_fires_after_the_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = Gt06Config {
            restart_delay: Duration::from_millis(50),
            ..test_config(addr.port())
        };
        let session = Gt06::new(config);

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        session.set_power_restart_hook(move || {
            sender.send(()).unwrap();
        });

        assert!(session.connect().await.is_err());

        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("power restart hook never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_closes_the_session() {
        let (port, server) = spawn_server(|mut socket| async move {
            // Hold the connection open; the client hangs up first.
            let mut chunk = [0_u8; 16];
            let _ = socket.read(&mut chunk).await;
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.connect().await.unwrap();

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let result = session.report_device_cmd(12345, "DYD=Success!").await;
        assert!(matches!(result, Err(Gt06Error::NotConnected)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_loss_aborts_pending_waits() {
        let (port, server) = spawn_server(|mut socket| async move {
            let _ = read_frame(&mut socket).await;
            // Drop the socket without acknowledging.
        })
        .await;

        let session = Gt06::new(test_config(port));
        session.set_device_status(test_status()).unwrap();
        session.connect().await.unwrap();

        // The reader observes the close and wakes the waiter before the
        // ack timeout.
        let result = session.report_device_status().await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
