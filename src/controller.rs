use crate::config::AppConfig;
use crate::models::{Station, StationListing, StationRef, View};
use crate::mpd::{MpdCommand, MpdConnection, MpdEvent, PlayState, PlayerStatus, SongInfo};
use crate::shoutcast::{self, ShoutcastClient};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const TRACK_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Connected { version: String },
    Disconnected,
}

/// What the station list currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingRequest {
    Genre(String),
    Search(String),
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    pub server: String,
    pub connection: ConnectionPhase,
    pub player: PlayerStatus,
    pub current_song: Option<SongInfo>,
    pub station: Option<StationRef>,
    pub station_track: Option<String>,
    pub view: View,
    pub genres: Vec<String>,
    pub genres_loading: bool,
    pub listing: Option<ListingRequest>,
    pub listing_loading: bool,
    pub search_query: String,
    pub stations: Vec<Station>,
    pub error: Option<String>,
    pub favorites: Vec<StationRef>,
    pub known_hosts: Vec<String>,
    pub list_height: u16,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            server: String::new(),
            connection: ConnectionPhase::Connecting,
            player: PlayerStatus::default(),
            current_song: None,
            station: None,
            station_track: None,
            view: View::default(),
            genres: vec![],
            genres_loading: false,
            listing: None,
            listing_loading: false,
            search_query: String::new(),
            stations: vec![],
            error: None,
            favorites: vec![],
            known_hosts: vec![],
            list_height: 300,
        }
    }

    pub fn label_text(&self) -> String {
        if let Some(song) = &self.current_song {
            let title = song.display_title();
            if !title.trim().is_empty() {
                return title;
            }
        }

        if let Some(st) = &self.station {
            let name = st.name.trim();
            if !name.is_empty() {
                return match self.station_track.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                    Some(track) => format!("{name}: {track}"),
                    None => name.to_string(),
                };
            }
        }

        "Pythagora".to_string()
    }

    pub fn server_text(&self) -> String {
        match &self.connection {
            ConnectionPhase::Connecting => format!("Connecting to {}…", self.server),
            ConnectionPhase::Connected { version } => {
                format!("Connected to {} (MPD {version})", self.server)
            }
            ConnectionPhase::Disconnected => "Not connected".to_string(),
        }
    }

    pub fn playlist_text(&self) -> String {
        let songs = match self.player.playlist_length {
            1 => "1 song".to_string(),
            n => format!("{n} songs"),
        };
        match (self.player.elapsed, self.player.duration) {
            (Some(e), Some(d)) if d > 0.0 => {
                format!("{songs} · {} / {}", format_time(e), format_time(d))
            }
            (Some(e), _) => format!("{songs} · {}", format_time(e)),
            _ => songs,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.player.state == PlayState::Play
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.favorites.iter().any(|f| f.id == id)
    }

    fn apply_listing(&mut self, request: &ListingRequest, res: shoutcast::Result<StationListing>) -> bool {
        if self.listing.as_ref() != Some(request) {
            return false;
        }
        self.listing_loading = false;
        match res {
            Ok(listing) => {
                self.stations = listing.stations;
                self.error = None;
            }
            Err(e) => {
                self.stations.clear();
                self.error = Some(e.to_string());
            }
        }
        true
    }

    fn begin_play(&mut self, station: StationRef) {
        self.error = None;
        self.station = Some(station);
        self.station_track = None;
    }

    fn stop_station(&mut self) {
        self.station = None;
        self.station_track = None;
    }

    fn is_current_station(&self, id: &str) -> bool {
        self.station.as_ref().is_some_and(|s| s.id == id)
    }

    /// Stream URLs to queue, if `station` is still the one the user picked
    /// and the directory returned any.
    fn take_resolution(
        &mut self,
        station: &StationRef,
        res: shoutcast::Result<Vec<String>>,
    ) -> Option<Vec<String>> {
        if !self.is_current_station(&station.id) {
            return None;
        }
        match res {
            Ok(urls) if urls.is_empty() => {
                self.error = Some(format!("{} has no stream URLs", station.name));
                None
            }
            Ok(urls) => Some(urls),
            Err(e) => {
                self.error = Some(e.to_string());
                None
            }
        }
    }

    fn apply_track(&mut self, station_id: &str, res: shoutcast::Result<Option<String>>) -> bool {
        if !self.is_current_station(station_id) {
            return false;
        }
        match res {
            Ok(track) => self.station_track = track,
            // the directory answers slowly; keep the last known track
            Err(e) => warn!(station = %station_id, error = %e, "current track lookup failed"),
        }
        true
    }
}

fn format_time(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[derive(Debug, Clone)]
pub enum UiCommand {
    LoadGenres,
    SelectGenre(String),
    Search(String),
    Play(StationRef),
    TogglePause,
    Stop,
    Next,
    Previous,
    SeekBy(f64),
    UpdateLibrary,
    RescanLibrary,
    ToggleFavorite(StationRef),
    ShowView(View),
    ResizeList(i32),
    ConnectTo(String),
    Disconnect,
    Shutdown,
}

pub struct ControllerHandle {
    pub cmd_tx: mpsc::UnboundedSender<UiCommand>,
    pub state_rx: watch::Receiver<ControllerState>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(UiCommand::Shutdown);
        if let Some(t) = self._thread.take() {
            let _ = t.join();
        }
    }
}

pub fn start_controller() -> ControllerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ControllerState::new());

    let thread = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "failed to start controller runtime");
                return;
            }
        };
        rt.block_on(async move {
            if let Err(e) = controller_main(cmd_rx, state_tx).await {
                warn!(error = ?e, "controller exited with error");
            }
        });
    });

    ControllerHandle {
        cmd_tx,
        state_rx,
        _thread: Some(thread),
    }
}

async fn controller_main(
    mut cmd_rx: mpsc::UnboundedReceiver<UiCommand>,
    state_tx: watch::Sender<ControllerState>,
) -> Result<()> {
    let mut config = tokio::task::spawn_blocking(AppConfig::load)
        .await
        .context("Join config load task")?
        .context("Failed to load config")?;

    let mut state = state_tx.borrow().clone();
    state.server = config.server.clone();
    state.favorites = config.favorites.clone();
    state.known_hosts = config.known_hosts.clone();
    state.view = config.layout.active_view;
    state.list_height = config.layout.list_height;
    state.station = config.last_station.clone();
    let _ = state_tx.send(state.clone());

    let (mpd, mut mpd_events) = MpdConnection::spawn(config.server.clone(), config.password.clone());
    let shoutcast = ShoutcastClient::new().context("Failed to build Shoutcast client")?;
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<InternalMsg>();

    let mut track_tick = tokio::time::interval(TRACK_REFRESH);
    track_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if state.view == View::Shoutcast {
        request_genres(&mut state, &shoutcast, &internal_tx);
        if let Some(genre) = config.last_genre.clone() {
            request_listing(&mut state, ListingRequest::Genre(genre), &shoutcast, &internal_tx);
        }
        let _ = state_tx.send(state.clone());
    }

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    UiCommand::LoadGenres => {
                        request_genres(&mut state, &shoutcast, &internal_tx);
                    }
                    UiCommand::SelectGenre(genre) => {
                        config.last_genre = Some(genre.clone());
                        persist(&config);
                        request_listing(&mut state, ListingRequest::Genre(genre), &shoutcast, &internal_tx);
                    }
                    UiCommand::Search(q) => {
                        let q = q.trim().to_string();
                        state.search_query = q.clone();
                        if q.is_empty() {
                            continue;
                        }
                        request_listing(&mut state, ListingRequest::Search(q), &shoutcast, &internal_tx);
                    }
                    UiCommand::Play(station) => {
                        state.begin_play(station.clone());
                        let client = shoutcast.clone();
                        let tx = internal_tx.clone();
                        tokio::spawn(async move {
                            let res = client.station_urls(&station.id).await;
                            let _ = tx.send(InternalMsg::ResolveDone { station, res });
                        });
                    }
                    UiCommand::TogglePause => send_mpd(&mpd, &mut state, MpdCommand::TogglePause),
                    UiCommand::Stop => {
                        send_mpd(&mpd, &mut state, MpdCommand::Stop);
                        state.stop_station();
                        if config.last_station.take().is_some() {
                            persist(&config);
                        }
                    }
                    UiCommand::Next => send_mpd(&mpd, &mut state, MpdCommand::Next),
                    UiCommand::Previous => send_mpd(&mpd, &mut state, MpdCommand::Previous),
                    UiCommand::SeekBy(secs) => send_mpd(&mpd, &mut state, MpdCommand::SeekBy(secs)),
                    UiCommand::UpdateLibrary => send_mpd(&mpd, &mut state, MpdCommand::UpdateLibrary),
                    UiCommand::RescanLibrary => send_mpd(&mpd, &mut state, MpdCommand::RescanLibrary),
                    UiCommand::ToggleFavorite(station) => {
                        config.toggle_favorite(station);
                        state.favorites = config.favorites.clone();
                        persist(&config);
                    }
                    UiCommand::ShowView(view) => {
                        state.view = view;
                        if view == View::Shoutcast && state.genres.is_empty() {
                            request_genres(&mut state, &shoutcast, &internal_tx);
                        }
                        if config.layout.active_view != view {
                            config.layout.active_view = view;
                            persist(&config);
                        }
                    }
                    UiCommand::ResizeList(delta) => {
                        let height = config.resize_list(delta);
                        if height != state.list_height {
                            state.list_height = height;
                            persist(&config);
                        }
                    }
                    UiCommand::ConnectTo(host) => {
                        let host = host.trim().to_string();
                        if host.is_empty() {
                            continue;
                        }
                        info!(%host, "switching mpd server");
                        config.server = host.clone();
                        config.remember_host(&host);
                        state.server = host.clone();
                        state.known_hosts = config.known_hosts.clone();
                        state.connection = ConnectionPhase::Connecting;
                        state.player = PlayerStatus::default();
                        state.current_song = None;
                        send_mpd(&mpd, &mut state, MpdCommand::Reconnect {
                            addr: host,
                            password: config.password.clone(),
                        });
                        persist(&config);
                    }
                    UiCommand::Disconnect => {
                        info!(server = %state.server, "disconnecting from mpd");
                        send_mpd(&mpd, &mut state, MpdCommand::Disconnect);
                        state.connection = ConnectionPhase::Disconnected;
                        state.player = PlayerStatus::default();
                        state.current_song = None;
                    }
                    UiCommand::Shutdown => {
                        let _ = mpd.command(MpdCommand::Shutdown);
                        return Ok(());
                    }
                }
                let _ = state_tx.send(state.clone());
            }
            ev = mpd_events.recv() => {
                let Some(ev) = ev else {
                    state.connection = ConnectionPhase::Disconnected;
                    state.error = Some("MPD connection task stopped".to_string());
                    let _ = state_tx.send(state.clone());
                    return Ok(());
                };
                match ev {
                    MpdEvent::Connected { version } => {
                        state.connection = ConnectionPhase::Connected { version };
                        state.error = None;
                        if !config.known_hosts.contains(&config.server) {
                            let server = config.server.clone();
                            config.remember_host(&server);
                            state.known_hosts = config.known_hosts.clone();
                            persist(&config);
                        }
                    }
                    MpdEvent::Status(status) => state.player = status,
                    MpdEvent::CurrentSong(song) => state.current_song = song,
                    MpdEvent::CommandFailed(e) => state.error = Some(e),
                    MpdEvent::Disconnected(e) => {
                        if state.connection != ConnectionPhase::Disconnected {
                            warn!(error = %e, "mpd unavailable");
                        }
                        state.connection = ConnectionPhase::Disconnected;
                        state.player = PlayerStatus::default();
                        state.current_song = None;
                    }
                }
                let _ = state_tx.send(state.clone());
            }
            _ = track_tick.tick() => {
                if let Some(station) = state.station.clone().filter(|_| state.is_playing()) {
                    request_track(station, &shoutcast, &internal_tx);
                }
            }
            Some(msg) = internal_rx.recv() => {
                match msg {
                    InternalMsg::GenresDone(res) => {
                        state.genres_loading = false;
                        match res {
                            Ok(genres) => state.genres = genres,
                            Err(e) => state.error = Some(e.to_string()),
                        }
                    }
                    InternalMsg::ListingDone { request, res } => {
                        if !state.apply_listing(&request, res) {
                            continue;
                        }
                    }
                    InternalMsg::ResolveDone { station, res } => {
                        if !state.is_current_station(&station.id) {
                            continue;
                        }
                        if let Some(urls) = state.take_resolution(&station, res) {
                            info!(station = %station.id, streams = urls.len(), "queueing station");
                            send_mpd(&mpd, &mut state, MpdCommand::AddUrls { urls, replace: true });
                            request_track(station.clone(), &shoutcast, &internal_tx);
                            config.last_station = Some(station);
                            persist(&config);
                        }
                    }
                    InternalMsg::TrackDone { station_id, res } => {
                        if !state.apply_track(&station_id, res) {
                            continue;
                        }
                    }
                }
                let _ = state_tx.send(state.clone());
            }
        }
    }
}

#[derive(Debug)]
enum InternalMsg {
    GenresDone(shoutcast::Result<Vec<String>>),
    ListingDone {
        request: ListingRequest,
        res: shoutcast::Result<StationListing>,
    },
    ResolveDone {
        station: StationRef,
        res: shoutcast::Result<Vec<String>>,
    },
    TrackDone {
        station_id: String,
        res: shoutcast::Result<Option<String>>,
    },
}

fn request_genres(
    state: &mut ControllerState,
    client: &ShoutcastClient,
    tx: &mpsc::UnboundedSender<InternalMsg>,
) {
    if state.genres_loading {
        return;
    }
    state.genres_loading = true;
    let client = client.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let res = client.genre_list().await;
        let _ = tx.send(InternalMsg::GenresDone(res));
    });
}

fn request_listing(
    state: &mut ControllerState,
    request: ListingRequest,
    client: &ShoutcastClient,
    tx: &mpsc::UnboundedSender<InternalMsg>,
) {
    state.listing = Some(request.clone());
    state.listing_loading = true;
    state.error = None;
    let client = client.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let res = match &request {
            ListingRequest::Genre(genre) => client.stations_for_genre(genre).await,
            ListingRequest::Search(q) => client.search(q).await,
        };
        let _ = tx.send(InternalMsg::ListingDone { request, res });
    });
}

fn request_track(station: StationRef, client: &ShoutcastClient, tx: &mpsc::UnboundedSender<InternalMsg>) {
    let client = client.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let res = client.current_track(&station.name).await;
        let _ = tx.send(InternalMsg::TrackDone {
            station_id: station.id,
            res,
        });
    });
}

fn send_mpd(mpd: &MpdConnection, state: &mut ControllerState, cmd: MpdCommand) {
    if let Err(e) = mpd.command(cmd) {
        state.error = Some(e.to_string());
    }
}

fn persist(config: &AppConfig) {
    let cfg = config.clone();
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || cfg.save_atomic()).await {
            Ok(Err(e)) => warn!(error = ?e, "failed to save config"),
            Err(e) => warn!(error = %e, "config save task failed"),
            Ok(Ok(())) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Station;
    use crate::shoutcast::ShoutcastError;

    fn station(id: &str, name: &str) -> Station {
        Station {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn label_prefers_song_then_station() {
        let mut state = ControllerState::new();
        assert_eq!(state.label_text(), "Pythagora");

        state.station = Some(StationRef {
            id: "1".into(),
            name: "Zeta Jazz".into(),
        });
        assert_eq!(state.label_text(), "Zeta Jazz");
        state.station_track = Some("So What".into());
        assert_eq!(state.label_text(), "Zeta Jazz: So What");

        state.current_song = Some(SongInfo {
            file: "http://one.example/".into(),
            title: Some("Blue in Green".into()),
            ..Default::default()
        });
        assert_eq!(state.label_text(), "Blue in Green");
    }

    #[test]
    fn status_lines() {
        let mut state = ControllerState::new();
        state.server = "mpd.lan:6600".into();
        assert_eq!(state.server_text(), "Connecting to mpd.lan:6600…");
        state.connection = ConnectionPhase::Connected {
            version: "0.23.5".into(),
        };
        assert_eq!(state.server_text(), "Connected to mpd.lan:6600 (MPD 0.23.5)");
        state.connection = ConnectionPhase::Disconnected;
        assert_eq!(state.server_text(), "Not connected");

        state.player.playlist_length = 1;
        assert_eq!(state.playlist_text(), "1 song");
        state.player.playlist_length = 12;
        state.player.elapsed = Some(65.4);
        state.player.duration = Some(3600.0);
        assert_eq!(state.playlist_text(), "12 songs · 1:05 / 60:00");
    }

    #[test]
    fn stale_listing_is_ignored() {
        let mut state = ControllerState::new();
        state.listing = Some(ListingRequest::Search("jazz".into()));
        state.listing_loading = true;

        let stale = ListingRequest::Genre("Rock".into());
        let listing = StationListing {
            tunein_base: None,
            stations: vec![station("9", "Rock FM")],
        };
        assert!(!state.apply_listing(&stale, Ok(listing)));
        assert!(state.stations.is_empty());
        assert!(state.listing_loading);

        let current = ListingRequest::Search("jazz".into());
        let listing = StationListing {
            tunein_base: None,
            stations: vec![station("1", "Jazz FM")],
        };
        assert!(state.apply_listing(&current, Ok(listing)));
        assert_eq!(state.stations.len(), 1);
        assert!(!state.listing_loading);
    }

    #[test]
    fn listing_error_is_reported() {
        let mut state = ControllerState::new();
        let request = ListingRequest::Genre("Jazz".into());
        state.listing = Some(request.clone());
        state.stations = vec![station("1", "Old")];

        let err = ShoutcastError::Http {
            code: 503,
            reason: "Service Unavailable".into(),
        };
        assert!(state.apply_listing(&request, Err(err)));
        assert!(state.stations.is_empty());
        assert_eq!(
            state.error.as_deref(),
            Some("Error (503): HTTP returned Service Unavailable")
        );
    }

    fn station_ref(id: &str, name: &str) -> StationRef {
        StationRef {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn late_resolution_of_previous_station_is_ignored() {
        let mut state = ControllerState::new();
        let first = station_ref("1", "Alpha");
        let second = station_ref("2", "Bravo");
        state.begin_play(first.clone());
        state.begin_play(second.clone());

        let urls = vec!["http://alpha.example/".to_string()];
        assert_eq!(state.take_resolution(&first, Ok(urls)), None);
        assert_eq!(state.error, None);
        assert_eq!(state.station, Some(second.clone()));

        let urls = vec!["http://bravo.example/".to_string()];
        assert_eq!(state.take_resolution(&second, Ok(urls.clone())), Some(urls));
    }

    #[test]
    fn resolution_without_streams_is_an_error() {
        let mut state = ControllerState::new();
        let station = station_ref("2", "Bravo");
        state.begin_play(station.clone());

        assert_eq!(state.take_resolution(&station, Ok(vec![])), None);
        assert_eq!(state.error.as_deref(), Some("Bravo has no stream URLs"));

        state.begin_play(station.clone());
        assert_eq!(state.error, None);
        let err = ShoutcastError::Http {
            code: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(state.take_resolution(&station, Err(err)), None);
        assert_eq!(state.error.as_deref(), Some("Error (404): HTTP returned Not Found"));
    }

    #[test]
    fn track_updates_only_for_current_station() {
        let mut state = ControllerState::new();
        state.begin_play(station_ref("1", "Alpha"));
        state.begin_play(station_ref("2", "Bravo"));

        assert!(!state.apply_track("1", Ok(Some("Alpha song".into()))));
        assert_eq!(state.station_track, None);

        assert!(state.apply_track("2", Ok(Some("Bravo song".into()))));
        assert_eq!(state.station_track.as_deref(), Some("Bravo song"));

        let err = ShoutcastError::Http {
            code: 502,
            reason: "Bad Gateway".into(),
        };
        assert!(state.apply_track("2", Err(err)));
        assert_eq!(state.station_track.as_deref(), Some("Bravo song"));
    }

    #[test]
    fn stop_forgets_the_station() {
        let mut state = ControllerState::new();
        state.begin_play(station_ref("2", "Bravo"));
        state.apply_track("2", Ok(Some("Bravo song".into())));
        assert_eq!(state.label_text(), "Bravo: Bravo song");

        state.stop_station();
        assert_eq!(state.station, None);
        assert_eq!(state.station_track, None);
        assert_eq!(state.label_text(), "Pythagora");
        assert!(!state.apply_track("2", Ok(Some("late".into()))));
    }
}
