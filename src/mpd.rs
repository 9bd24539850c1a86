use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum MpdError {
    #[error("MPD error {code} in `{command}`: {message}")]
    Ack {
        code: u32,
        index: u32,
        command: String,
        message: String,
    },

    #[error("MPD protocol error: {0}")]
    Protocol(String),

    #[error("MPD connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MPD did not answer `{0}` in time")]
    Timeout(String),
}

#[derive(Debug, Clone)]
pub enum MpdCommand {
    Play,
    TogglePause,
    Stop,
    Next,
    Previous,
    /// Relative seek in the current song, in seconds.
    SeekBy(f64),
    AddUrls { urls: Vec<String>, replace: bool },
    UpdateLibrary,
    RescanLibrary,
    Reconnect { addr: String, password: Option<String> },
    /// Drops the connection and stays idle until the next `Reconnect`.
    Disconnect,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum MpdEvent {
    Connected { version: String },
    Status(PlayerStatus),
    CurrentSong(Option<SongInfo>),
    CommandFailed(String),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stop,
    Play,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerStatus {
    pub state: PlayState,
    pub volume: Option<u8>,
    pub playlist_length: u32,
    pub elapsed: Option<f64>,
    pub duration: Option<f64>,
}

impl PlayerStatus {
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut status = Self::default();
        let mut legacy_time: Option<f64> = None;
        for (key, value) in pairs {
            match key.as_str() {
                "state" => {
                    status.state = match value.as_str() {
                        "play" => PlayState::Play,
                        "pause" => PlayState::Pause,
                        _ => PlayState::Stop,
                    }
                }
                "volume" => {
                    status.volume = value
                        .parse::<i32>()
                        .ok()
                        .and_then(|v| u8::try_from(v).ok())
                }
                "playlistlength" => status.playlist_length = value.parse().unwrap_or(0),
                "elapsed" => status.elapsed = value.parse().ok(),
                "duration" => status.duration = value.parse().ok(),
                // pre-0.20 daemons only report "time: <elapsed>:<total>"
                "time" => {
                    legacy_time = value.split_once(':').and_then(|(_, total)| total.parse().ok())
                }
                _ => {}
            }
        }
        if status.duration.is_none() {
            status.duration = legacy_time;
        }
        status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SongInfo {
    pub file: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub name: Option<String>,
}

impl SongInfo {
    /// `None` when nothing is queued.
    pub fn from_pairs(pairs: &[(String, String)]) -> Option<Self> {
        let mut song = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "file" => song.file = value.clone(),
                "Title" => song.title = Some(value.clone()),
                "Artist" => song.artist = Some(value.clone()),
                "Name" => song.name = Some(value.clone()),
                _ => {}
            }
        }
        if song.file.is_empty() {
            None
        } else {
            Some(song)
        }
    }

    pub fn display_title(&self) -> String {
        let title = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let artist = self.artist.as_deref().map(str::trim).filter(|a| !a.is_empty());
        match (artist, title) {
            (Some(a), Some(t)) => format!("{a} - {t}"),
            (None, Some(t)) => t.to_string(),
            _ => self
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(&self.file)
                .to_string(),
        }
    }
}

/// A single connection speaking the MPD text protocol.
pub struct MpdStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    version: String,
    timeout: Duration,
}

impl MpdStream {
    /// Connects and reads the greeting. Unbounded; callers wrap it in a timeout.
    pub async fn connect(addr: &str) -> Result<Self, MpdError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        let version = parse_greeting(&greeting)?;
        Ok(Self {
            reader,
            writer,
            version,
            timeout: COMMAND_TIMEOUT,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends one command and collects its `key: value` lines up to `OK`.
    ///
    /// A reply slower than the stream timeout yields [`MpdError::Timeout`];
    /// the connection is unusable afterwards.
    pub async fn command(&mut self, name: &str, args: &[&str]) -> Result<Vec<(String, String)>, MpdError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.exchange(name, args))
            .await
            .map_err(|_| MpdError::Timeout(name.to_string()))?
    }

    async fn exchange(&mut self, name: &str, args: &[&str]) -> Result<Vec<(String, String)>, MpdError> {
        let request = format_command(name, args);
        debug!(command = name, "mpd request");
        self.writer.write_all(request.as_bytes()).await?;

        let mut pairs = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(MpdError::Protocol("connection closed".to_string()));
            }
            match parse_response_line(line.trim_end_matches(['\r', '\n']))? {
                ResponseLine::Ok => return Ok(pairs),
                ResponseLine::Pair(key, value) => pairs.push((key, value)),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ResponseLine {
    Ok,
    Pair(String, String),
}

fn parse_greeting(line: &str) -> Result<String, MpdError> {
    line.trim_end()
        .strip_prefix("OK MPD ")
        .map(str::to_string)
        .ok_or_else(|| MpdError::Protocol(format!("unexpected greeting: {}", line.trim_end())))
}

fn parse_response_line(line: &str) -> Result<ResponseLine, MpdError> {
    if line == "OK" {
        return Ok(ResponseLine::Ok);
    }
    if let Some(rest) = line.strip_prefix("ACK ") {
        return Err(parse_ack(rest));
    }
    line.split_once(": ")
        .map(|(k, v)| ResponseLine::Pair(k.to_string(), v.to_string()))
        .ok_or_else(|| MpdError::Protocol(format!("unexpected line: {line}")))
}

// ACK [<code>@<index>] {<command>} <message>
fn parse_ack(rest: &str) -> MpdError {
    let parsed = (|| {
        let rest = rest.strip_prefix('[')?;
        let (codes, rest) = rest.split_once(']')?;
        let (code, index) = codes.split_once('@')?;
        let rest = rest.trim_start().strip_prefix('{')?;
        let (command, message) = rest.split_once('}')?;
        Some(MpdError::Ack {
            code: code.parse().ok()?,
            index: index.parse().ok()?,
            command: command.to_string(),
            message: message.trim().to_string(),
        })
    })();
    parsed.unwrap_or_else(|| MpdError::Protocol(format!("malformed ACK: {rest}")))
}

fn format_command(name: &str, args: &[&str]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push_str(" \"");
        for c in arg.chars() {
            if c == '"' || c == '\\' {
                line.push('\\');
            }
            line.push(c);
        }
        line.push('"');
    }
    line.push('\n');
    line
}

#[derive(Debug)]
pub struct MpdConnection {
    cmd_tx: mpsc::UnboundedSender<MpdCommand>,
}

impl MpdConnection {
    /// Starts the connection task; it reconnects on its own until shut down.
    pub fn spawn(addr: String, password: Option<String>) -> (Self, mpsc::UnboundedReceiver<MpdEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_mpd(Some(addr), password, cmd_rx, evt_tx));

        (Self { cmd_tx }, evt_rx)
    }

    pub fn command(&self, cmd: MpdCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| anyhow!("mpd task is not running"))
    }
}

enum Exit {
    Shutdown,
    Reconnect { addr: String, password: Option<String> },
    Disconnect,
}

enum Idle {
    Shutdown,
    Retarget,
    Ignore,
}

/// Handles a command received while no session is open.
fn handle_idle(cmd: Option<MpdCommand>, addr: &mut Option<String>, password: &mut Option<String>) -> Idle {
    match cmd {
        None | Some(MpdCommand::Shutdown) => Idle::Shutdown,
        Some(MpdCommand::Reconnect { addr: a, password: p }) => {
            *addr = Some(a);
            *password = p;
            Idle::Retarget
        }
        Some(MpdCommand::Disconnect) => {
            *addr = None;
            Idle::Retarget
        }
        Some(other) => {
            debug!(command = ?other, "dropping command while disconnected");
            Idle::Ignore
        }
    }
}

async fn run_mpd(
    mut addr: Option<String>,
    mut password: Option<String>,
    mut cmd_rx: mpsc::UnboundedReceiver<MpdCommand>,
    evt_tx: mpsc::UnboundedSender<MpdEvent>,
) {
    let mut backoff = Duration::from_millis(200);
    'session: loop {
        let Some(target) = addr.clone() else {
            match handle_idle(cmd_rx.recv().await, &mut addr, &mut password) {
                Idle::Shutdown => return,
                Idle::Retarget => backoff = Duration::from_millis(200),
                Idle::Ignore => {}
            }
            continue;
        };

        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, open(target.clone(), password.clone()));
        tokio::pin!(attempt);
        let opened = loop {
            tokio::select! {
                res = &mut attempt => {
                    break res.unwrap_or_else(|_| Err(MpdError::Timeout("connect".to_string())));
                }
                cmd = cmd_rx.recv() => match handle_idle(cmd, &mut addr, &mut password) {
                    Idle::Shutdown => return,
                    Idle::Retarget => {
                        backoff = Duration::from_millis(200);
                        continue 'session;
                    }
                    Idle::Ignore => {}
                }
            }
        };

        match opened {
            Ok(mut stream) => {
                backoff = Duration::from_millis(200);
                info!(addr = %target, version = stream.version(), "connected to mpd");
                let _ = evt_tx.send(MpdEvent::Connected {
                    version: stream.version().to_string(),
                });
                match io_loop(&mut stream, &mut cmd_rx, &evt_tx).await {
                    Ok(Exit::Shutdown) => return,
                    Ok(Exit::Reconnect { addr: a, password: p }) => {
                        addr = Some(a);
                        password = p;
                    }
                    Ok(Exit::Disconnect) => {
                        info!(addr = %target, "disconnected from mpd");
                        addr = None;
                        let _ = evt_tx.send(MpdEvent::Disconnected("disconnected".to_string()));
                    }
                    Err(e) => {
                        warn!(addr = %target, error = %e, "mpd connection lost");
                        let _ = evt_tx.send(MpdEvent::Disconnected(e.to_string()));
                    }
                }
            }
            Err(e) => {
                let _ = evt_tx.send(MpdEvent::Disconnected(e.to_string()));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {
                        backoff = std::cmp::min(backoff * 2, Duration::from_secs(5));
                    }
                    cmd = cmd_rx.recv() => match handle_idle(cmd, &mut addr, &mut password) {
                        Idle::Shutdown => return,
                        Idle::Retarget => backoff = Duration::from_millis(200),
                        Idle::Ignore => {}
                    }
                }
            }
        }
    }
}

async fn open(addr: String, password: Option<String>) -> Result<MpdStream, MpdError> {
    let mut stream = MpdStream::connect(&addr).await?;
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        stream.command("password", &[password.as_str()]).await?;
    }
    Ok(stream)
}

async fn io_loop(
    stream: &mut MpdStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<MpdCommand>,
    evt_tx: &mpsc::UnboundedSender<MpdEvent>,
) -> Result<Exit, MpdError> {
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_status: Option<PlayerStatus> = None;
    let mut last_song: Option<Option<SongInfo>> = None;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let status = PlayerStatus::from_pairs(&stream.command("status", &[]).await?);
                if last_status.as_ref() != Some(&status) {
                    last_status = Some(status.clone());
                    let _ = evt_tx.send(MpdEvent::Status(status));
                }
                let song = SongInfo::from_pairs(&stream.command("currentsong", &[]).await?);
                if last_song.as_ref() != Some(&song) {
                    last_song = Some(song.clone());
                    let _ = evt_tx.send(MpdEvent::CurrentSong(song));
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return Ok(Exit::Shutdown); };
                match cmd {
                    MpdCommand::Shutdown => return Ok(Exit::Shutdown),
                    MpdCommand::Disconnect => return Ok(Exit::Disconnect),
                    MpdCommand::Reconnect { addr, password } => {
                        return Ok(Exit::Reconnect { addr, password });
                    }
                    other => match run_command(stream, other).await {
                        Ok(()) => poll.reset_immediately(),
                        Err(e @ MpdError::Ack { .. }) => {
                            let _ = evt_tx.send(MpdEvent::CommandFailed(e.to_string()));
                        }
                        Err(e) => return Err(e),
                    },
                }
            }
        }
    }
}

async fn run_command(stream: &mut MpdStream, cmd: MpdCommand) -> Result<(), MpdError> {
    match cmd {
        MpdCommand::Play => {
            stream.command("play", &[]).await?;
        }
        MpdCommand::TogglePause => {
            let status = PlayerStatus::from_pairs(&stream.command("status", &[]).await?);
            match status.state {
                PlayState::Play => stream.command("pause", &["1"]).await?,
                PlayState::Pause => stream.command("pause", &["0"]).await?,
                PlayState::Stop => stream.command("play", &[]).await?,
            };
        }
        MpdCommand::Stop => {
            stream.command("stop", &[]).await?;
        }
        MpdCommand::Next => {
            stream.command("next", &[]).await?;
        }
        MpdCommand::Previous => {
            stream.command("previous", &[]).await?;
        }
        MpdCommand::SeekBy(secs) => {
            stream.command("seekcur", &[format_offset(secs).as_str()]).await?;
        }
        MpdCommand::AddUrls { urls, replace } => {
            if replace {
                stream.command("clear", &[]).await?;
            }
            for url in &urls {
                stream.command("add", &[url.as_str()]).await?;
            }
            if replace && !urls.is_empty() {
                stream.command("play", &[]).await?;
            }
        }
        MpdCommand::UpdateLibrary => {
            stream.command("update", &[]).await?;
        }
        MpdCommand::RescanLibrary => {
            stream.command("rescan", &[]).await?;
        }
        MpdCommand::Reconnect { .. } | MpdCommand::Disconnect | MpdCommand::Shutdown => {}
    }
    Ok(())
}

// seekcur treats a leading sign as relative to the current position
fn format_offset(secs: f64) -> String {
    if secs >= 0.0 {
        format!("+{secs}")
    } else {
        format!("{secs}")
    }
}
