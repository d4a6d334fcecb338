//! mpv-backed playback device, one mpv process per stem.
//!
//! Architecture:
//!
//! ```text
//!   MpvDevice::spawn(tag)
//!         │
//!         ├── writer_task    ← receives PendingRequest via mpsc, serialises → socket
//!         ├── reader_task    ← reads JSON lines from socket
//!         │                      ├── response (has request_id) → matched oneshot::Sender
//!         │                      └── event / property-change   → event channel
//!         └── forward_events ← maps MpvEvent → DeviceEvent for the live subscription
//! ```
//!
//! A new subscription only goes live on the `start-file` that follows its
//! `loadfile`.  `load` queues an `Inbound::Arm` behind every event read before
//! the pre-load pause reply, so nothing from the previous file can be stamped
//! with the new generation.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::error::PlaybackError;
use crate::playback::{DeviceEvent, DeviceEventSender, PlaybackDevice, Subscription};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_TIME_POS: u64 = 1;
pub const OBS_DURATION: u64 = 2;
pub const OBS_EOF_REACHED: u64 = 3;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = oneshot::Sender<anyhow::Result<Value>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: Reply,
}

/// What the forwarder consumes, in socket order.
#[derive(Debug)]
pub enum Inbound {
    Event(MpvEvent),
    /// The next `start-file` belongs to the load made for this generation.
    Arm(u64),
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// Translate into a playback notification.  Property changes with no
    /// value (nothing loaded yet) and end-file reasons other than `eof` and
    /// `error` map to nothing; a `stop` or `redirect` from replacing the file
    /// is not the end of the stem.  With `--keep-open` the end of a stem is
    /// `eof-reached` turning true.
    pub fn to_device_event(&self) -> Option<DeviceEvent> {
        if let Some((id, data)) = self.as_property_change() {
            return match id {
                OBS_TIME_POS => data.as_f64().map(DeviceEvent::PositionUpdated),
                OBS_DURATION => data
                    .as_f64()
                    .map(|duration_secs| DeviceEvent::MetadataReady { duration_secs }),
                OBS_EOF_REACHED => (data.as_bool() == Some(true)).then_some(DeviceEvent::Ended),
                _ => None,
            };
        }

        if self.event_name()? != "end-file" {
            return None;
        }
        match self.raw.get("reason").and_then(Value::as_str) {
            Some("eof") => Some(DeviceEvent::Ended),
            Some("error") => {
                let reason = self
                    .raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error");
                Some(DeviceEvent::Error(reason.to_string()))
            }
            _ => None,
        }
    }
}

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    fn request(
        command: Value,
    ) -> anyhow::Result<(PendingRequest, oneshot::Receiver<anyhow::Result<Value>>)> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        Ok((
            PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            },
            reply_rx,
        ))
    }

    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (request, reply_rx) = Self::request(command)?;
        let req_id = request.req_id;
        self.tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Queue a command without waiting for its reply.
    pub fn fire(&self, command: Value) -> anyhow::Result<()> {
        let (request, _) = Self::request(command)?;
        self.tx
            .try_send(request)
            .map_err(|e| anyhow::anyhow!("mpv command not queued: {}", e))
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn seek_to(&self, secs: f64) -> anyhow::Result<()> {
        self.send(json!(["set_property", "time-pos", secs])).await?;
        Ok(())
    }

    pub async fn loadfile(&self, url: &str) -> anyhow::Result<()> {
        debug!("mpv: sending loadfile command for url={}", url);
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    /// Rewind without waiting; used when a kept-open file reaches its end.
    pub fn rewind(&self) -> anyhow::Result<()> {
        self.fire(json!(["seek", 0, "absolute"]))
    }

    /// Register observe_property for position, duration and end of file.
    /// Must be called after every fresh connection.
    pub async fn observe_playback_properties(&self) {
        let props = [
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_EOF_REACHED, "eof-reached"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// Wire an mpv IPC stream to a writer and a reader task.
fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<Inbound>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // req_id → reply channel.  The writer inserts, the reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else if event_tx
                    .send(Inbound::Event(MpvEvent { raw: val }))
                    .await
                    .is_err()
                {
                    debug!("mpv reader: event receiver gone");
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Which subscription mpv events are delivered to.
#[derive(Default)]
struct Route {
    /// Waiting for the `start-file` of its own load.
    pending: Option<DeviceEventSender>,
    armed: bool,
    live: Option<DeviceEventSender>,
}

type SharedRoute = Arc<std::sync::Mutex<Route>>;

impl Route {
    fn subscribe(&mut self, sender: DeviceEventSender) {
        self.live = None;
        self.armed = false;
        self.pending = Some(sender);
    }

    /// Generation the next load is made for.  A load without a fresh
    /// subscription parks the live one until the new file starts.
    fn load_target(&mut self) -> Option<u64> {
        if self.pending.is_none() {
            self.pending = self.live.take();
            self.armed = false;
        }
        self.pending.as_ref().map(DeviceEventSender::generation)
    }

    fn arm(&mut self, generation: u64) {
        if self.pending.as_ref().map(DeviceEventSender::generation) == Some(generation) {
            self.armed = true;
        }
    }

    fn file_started(&mut self) -> Option<u64> {
        if !self.armed {
            return None;
        }
        self.armed = false;
        self.live = self.pending.take();
        self.live.as_ref().map(DeviceEventSender::generation)
    }
}

fn lock_route(route: &SharedRoute) -> std::sync::MutexGuard<'_, Route> {
    match route.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Route device events to whichever subscription is live.
async fn forward_events(mut inbound: mpsc::Receiver<Inbound>, route: SharedRoute, handle: MpvHandle) {
    while let Some(item) = inbound.recv().await {
        let event = match item {
            Inbound::Arm(generation) => {
                lock_route(&route).arm(generation);
                continue;
            }
            Inbound::Event(event) => event,
        };

        if event.event_name() == Some("start-file") {
            if let Some(generation) = lock_route(&route).file_started() {
                debug!("mpv: subscription {} is live", generation);
            }
            continue;
        }

        let Some(mapped) = event.to_device_event() else {
            continue;
        };
        if mapped == DeviceEvent::Ended {
            if let Err(e) = handle.rewind() {
                warn!("mpv: rewind after end of file failed: {}", e);
            }
        }

        let sender = lock_route(&route).live.clone();
        match sender {
            Some(sender) => {
                if !sender.emit(mapped) {
                    debug!("mpv: subscription {} released", sender.generation());
                }
            }
            None => debug!("mpv: dropping {:?}, no live subscription", mapped),
        }
    }
    debug!("mpv: event forwarder exiting");
}

/// Owns one mpv child process and its IPC connection.
pub struct MpvDevice {
    handle: MpvHandle,
    route: SharedRoute,
    inbound: mpsc::Sender<Inbound>,
    forwarder: JoinHandle<()>,
    socket_name: String,
    // kill_on_drop: the process goes away with the device.
    _process: Option<tokio::process::Child>,
}

impl MpvDevice {
    /// Spawn a dedicated mpv (idle, no video) and connect to its IPC socket.
    /// `tag` distinguishes the socket of this device from its siblings.
    pub async fn spawn(tag: &str) -> anyhow::Result<Self> {
        let socket_name = sur_proto::platform::mpv_socket_name(tag);
        let mpv_binary =
            sur_proto::platform::find_mpv_binary().context("mpv binary not found")?;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&socket_name).await;

        let data_dir = sur_proto::platform::data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let stderr_path = data_dir.join("mpv-stderr.log");
        let stderr_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)
            .with_context(|| format!("opening {}", stderr_path.display()))?;

        info!("mpv: spawning {} for {}", mpv_binary.display(), tag);
        let child = tokio::process::Command::new(&mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=yes")
            .arg("--pause")
            .arg(sur_proto::platform::mpv_socket_arg(&socket_name))
            .arg("--quiet")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(stderr_file)
            .kill_on_drop(true)
            .spawn()
            .context("spawning mpv")?;
        info!("mpv: spawned process with pid {:?}", child.id());

        let (event_tx, event_rx) = mpsc::channel::<Inbound>(256);
        let handle = connect(&socket_name, event_tx.clone()).await?;
        Ok(Self::from_handle(handle, (event_tx, event_rx), socket_name, Some(child)).await)
    }

    async fn from_handle(
        handle: MpvHandle,
        (inbound, inbound_rx): (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>),
        socket_name: String,
        process: Option<tokio::process::Child>,
    ) -> Self {
        handle.observe_playback_properties().await;
        let route = SharedRoute::default();
        let forwarder = tokio::spawn(forward_events(inbound_rx, route.clone(), handle.clone()));
        Self {
            handle,
            route,
            inbound,
            forwarder,
            socket_name,
            _process: process,
        }
    }

    pub fn handle(&self) -> &MpvHandle {
        &self.handle
    }
}

#[cfg(unix)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<Inbound>) -> anyhow::Result<MpvHandle> {
    let socket_path = std::path::Path::new(socket_name);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }

    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_name))?;
    info!("mpv: connected to IPC socket");
    Ok(start_io_tasks(stream, event_tx))
}

#[cfg(windows)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<Inbound>) -> anyhow::Result<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            info!("mpv: connected to named pipe");
            return Ok(start_io_tasks(client, event_tx));
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

impl Drop for MpvDevice {
    fn drop(&mut self) {
        self.forwarder.abort();
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_name);
    }
}

impl PlaybackDevice for MpvDevice {
    /// Load paused; playback starts on an explicit unpause.
    fn load(&self, url: &str) -> impl Future<Output = Result<(), PlaybackError>> + Send {
        let handle = self.handle.clone();
        let route = self.route.clone();
        let inbound = self.inbound.clone();
        let url = url.to_string();
        async move {
            handle
                .set_pause(true)
                .await
                .map_err(|e| PlaybackError::Load(e.to_string()))?;
            // Every event mpv wrote before that reply is already queued.
            let target = lock_route(&route).load_target();
            if let Some(generation) = target {
                if inbound.send(Inbound::Arm(generation)).await.is_err() {
                    warn!("mpv: event forwarder gone");
                }
            }
            handle
                .loadfile(&url)
                .await
                .map_err(|e| PlaybackError::Load(e.to_string()))
        }
    }

    fn play(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send {
        let handle = self.handle.clone();
        async move {
            handle
                .set_pause(false)
                .await
                .map_err(|e| PlaybackError::Play(e.to_string()))
        }
    }

    fn pause(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send {
        let handle = self.handle.clone();
        async move {
            handle
                .set_pause(true)
                .await
                .map_err(|e| PlaybackError::Play(e.to_string()))
        }
    }

    fn seek_to(&self, secs: f64) -> impl Future<Output = Result<(), PlaybackError>> + Send {
        let handle = self.handle.clone();
        async move {
            handle
                .seek_to(secs)
                .await
                .map_err(|e| PlaybackError::Device(e.to_string()))
        }
    }

    fn set_muted(&self, muted: bool) {
        if let Err(e) = self.handle.fire(json!(["set_property", "mute", muted])) {
            warn!("mpv: mute={} not applied: {}", muted, e);
        }
    }

    fn subscribe(&self) -> Subscription {
        let (sender, subscription) = Subscription::channel();
        lock_route(&self.route).subscribe(sender);
        subscription
    }
}
