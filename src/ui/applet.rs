use crate::controller::{start_controller, ListingRequest, UiCommand};
use crate::models::{Station, StationRef, View};
use cosmic::app::{Core, Task};
use cosmic::iced::{Length, Rectangle};
use cosmic::iced_runtime::core::window;
use cosmic::surface::action::{app_popup, destroy_popup};
use cosmic::widget;

const APP_ID: &str = "io.github.pythagora.Pythagora";

pub struct Pythagora {
    core: Core,
    controller: crate::controller::ControllerHandle,
    state: crate::controller::ControllerState,
    popup: Option<cosmic::iced::window::Id>,
}

#[derive(Clone, Debug)]
pub enum Message {
    PopupClosed(cosmic::iced::window::Id),
    Surface(cosmic::surface::Action),
    ControllerState(crate::controller::ControllerState),
    SearchInput(String),
    SearchSubmit,
    SelectGenre(String),
    PlayStation(StationRef),
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
    Noop,
}

impl cosmic::Application for Pythagora {
    type Executor = cosmic::SingleThreadExecutor;
    type Flags = ();
    type Message = Message;
    const APP_ID: &'static str = APP_ID;

    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn init(core: Core, _flags: Self::Flags) -> (Self, Task<Message>) {
        let controller = start_controller();
        let state = controller.state_rx.borrow().clone();
        (
            Self {
                core,
                controller,
                state,
                popup: None,
            },
            Task::none(),
        )
    }

    fn on_close_requested(&self, id: window::Id) -> Option<Message> {
        Some(Message::PopupClosed(id))
    }

    fn subscription(&self) -> cosmic::iced::Subscription<Message> {
        use cosmic::iced_futures::futures::SinkExt;

        let mut rx = self.controller.state_rx.clone();
        cosmic::iced::Subscription::run_with_id(
            "controller_state",
            cosmic::iced_futures::stream::channel(16, move |mut output| async move {
                loop {
                    if rx.changed().await.is_err() {
                        break;
                    }
                    let snapshot = rx.borrow().clone();
                    let _ = output.send(Message::ControllerState(snapshot)).await;
                }
            }),
        )
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        let cmd = match message {
            Message::PopupClosed(id) => {
                if self.popup.as_ref() == Some(&id) {
                    self.popup = None;
                }
                None
            }
            Message::Surface(a) => {
                return cosmic::task::message(cosmic::Action::Cosmic(
                    cosmic::app::Action::Surface(a),
                ))
            }
            Message::ControllerState(s) => {
                // keep what the user is typing
                let query = std::mem::take(&mut self.state.search_query);
                self.state = s;
                if !query.is_empty() {
                    self.state.search_query = query;
                }
                None
            }
            Message::SearchInput(s) => {
                self.state.search_query = s;
                None
            }
            Message::SearchSubmit => Some(UiCommand::Search(self.state.search_query.clone())),
            Message::SelectGenre(g) => Some(UiCommand::SelectGenre(g)),
            Message::PlayStation(s) => Some(UiCommand::Play(s)),
            Message::TogglePause => Some(UiCommand::TogglePause),
            Message::Stop => Some(UiCommand::Stop),
            Message::Next => Some(UiCommand::Next),
            Message::Previous => Some(UiCommand::Previous),
            Message::SeekBy(secs) => Some(UiCommand::SeekBy(secs)),
            Message::UpdateLibrary => Some(UiCommand::UpdateLibrary),
            Message::RescanLibrary => Some(UiCommand::RescanLibrary),
            Message::ResizeList(delta) => Some(UiCommand::ResizeList(delta)),
            Message::Disconnect => Some(UiCommand::Disconnect),
            Message::ToggleFavorite(s) => Some(UiCommand::ToggleFavorite(s)),
            Message::ShowView(v) => {
                self.state.view = v;
                Some(UiCommand::ShowView(v))
            }
            Message::ConnectTo(host) => Some(UiCommand::ConnectTo(host)),
            Message::Noop => None,
        };
        if let Some(cmd) = cmd {
            let _ = self.controller.cmd_tx.send(cmd);
        }
        Task::none()
    }

    fn view(&self) -> cosmic::Element<'_, Message> {
        let have_popup = self.popup;

        let full_label = self.state.label_text();
        let label = ellipsize_chars(&full_label, 30);

        let btn = self
            .core
            .applet
            .text_button(
                widget::text::body(label).width(Length::Fixed(240.0)),
                Message::Noop,
            )
            .width(Length::Fixed(240.0))
            .on_press_with_rectangle(move |offset, bounds| {
                if let Some(id) = have_popup {
                    Message::Surface(destroy_popup(id))
                } else {
                    Message::Surface(app_popup::<Pythagora>(
                        move |state: &mut Pythagora| {
                            let new_id = cosmic::iced::window::Id::unique();
                            state.popup = Some(new_id);
                            let mut popup_settings = state.core.applet.get_popup_settings(
                                state.core.main_window_id().unwrap(),
                                new_id,
                                None,
                                None,
                                None,
                            );

                            popup_settings.positioner.anchor_rect = Rectangle {
                                x: (bounds.x - offset.x) as i32,
                                y: (bounds.y - offset.y) as i32,
                                width: bounds.width as i32,
                                height: bounds.height as i32,
                            };

                            popup_settings
                        },
                        Some(Box::new(|state: &Pythagora| {
                            state.popup_content().map(cosmic::Action::App)
                        })),
                    ))
                }
            });

        let with_tooltip = self.core.applet.applet_tooltip::<Message>(
            btn,
            full_label,
            self.popup.is_some(),
            Message::Surface,
            None,
        );

        self.core.applet.autosize_window(with_tooltip).into()
    }

    fn view_window(&self, _id: cosmic::iced::window::Id) -> cosmic::Element<'_, Message> {
        "Pythagora".into()
    }

    fn style(&self) -> Option<cosmic::iced_runtime::Appearance> {
        Some(cosmic::applet::style())
    }
}

fn ellipsize_chars(s: &str, max_chars: usize) -> String {
    let mut it = s.chars();
    let taken: String = it.by_ref().take(max_chars).collect();
    if it.next().is_some() {
        format!("{taken}…")
    } else {
        taken
    }
}

impl Pythagora {
    fn popup_content(&self) -> cosmic::Element<'_, Message> {
        let cosmic::cosmic_theme::Spacing {
            space_xxs,
            space_s,
            ..
        } = cosmic::theme::spacing();

        let play_label = if self.state.is_playing() { "Pause" } else { "Play" };
        let controls = widget::row()
            .spacing(space_xxs)
            .push(widget::button::text("Previous").on_press(Message::Previous))
            .push(widget::button::text(play_label).on_press(Message::TogglePause))
            .push(widget::button::text("Stop").on_press(Message::Stop))
            .push(widget::button::text("Next").on_press(Message::Next));

        let tabs = widget::row()
            .spacing(space_xxs)
            .push(tab_button("Current Playlist", View::Playlist, self.state.view))
            .push(tab_button("Shoutcast", View::Shoutcast, self.state.view));

        let mut content = widget::column()
            .spacing(space_s)
            .padding(space_s)
            .push(widget::text::caption(self.state.server_text()))
            .push(controls)
            .push(tabs);

        if let Some(err) = &self.state.error {
            content = content.push(widget::text::body(err));
        }

        content = match self.state.view {
            View::Playlist => content.push(self.playlist_view()),
            View::Shoutcast => content.push(self.shoutcast_view()),
        };

        cosmic::Element::from(self.core.applet.popup_container(content))
    }

    fn playlist_view(&self) -> cosmic::Element<'_, Message> {
        let now_playing = self
            .state
            .current_song
            .as_ref()
            .map(|s| s.display_title())
            .unwrap_or_else(|| "Nothing playing".to_string());

        let seek = widget::row()
            .spacing(4)
            .push(widget::button::text("−10 s").on_press(Message::SeekBy(-10.0)))
            .push(widget::button::text("+10 s").on_press(Message::SeekBy(10.0)));

        let library = widget::row()
            .spacing(4)
            .push(widget::button::text("Update library").on_press(Message::UpdateLibrary))
            .push(widget::button::text("Rescan library").on_press(Message::RescanLibrary));

        let mut column = widget::column()
            .spacing(4)
            .push(widget::text::body(now_playing))
            .push(widget::text::caption(self.state.playlist_text()))
            .push(seek)
            .push(library);

        if !self.state.favorites.is_empty() {
            let mut list = widget::list_column().padding(0).spacing(0);
            for fav in &self.state.favorites {
                list = list.add(
                    widget::button::custom(widget::text::body(&fav.name))
                        .on_press(Message::PlayStation(fav.clone()))
                        .width(Length::Fill),
                );
            }
            column = column
                .push(widget::text::caption("Favorite stations"))
                .push(list);
        }

        if !self.state.known_hosts.is_empty() {
            let mut hosts = widget::list_column().padding(0).spacing(0).add(
                widget::button::custom(widget::text::body("None (disconnect)"))
                    .on_press(Message::Disconnect)
                    .width(Length::Fill),
            );
            for host in &self.state.known_hosts {
                let label = if *host == self.state.server {
                    format!("● {host}")
                } else {
                    host.clone()
                };
                hosts = hosts.add(
                    widget::button::custom(widget::text::body(label))
                        .on_press(Message::ConnectTo(host.clone()))
                        .width(Length::Fill),
                );
            }
            column = column.push(widget::text::caption("Connect to")).push(hosts);
        }

        column.into()
    }

    fn shoutcast_view(&self) -> cosmic::Element<'_, Message> {
        let search = widget::search_input("Search Shoutcast…", &self.state.search_query)
            .on_input(Message::SearchInput)
            .on_submit(|_| Message::SearchSubmit);

        let resize = widget::row()
            .spacing(4)
            .push(widget::button::text("Shorter list").on_press(Message::ResizeList(-60)))
            .push(widget::button::text("Taller list").on_press(Message::ResizeList(60)));

        let mut column = widget::column().spacing(4).push(search).push(resize);

        if self.state.genres_loading && self.state.genres.is_empty() {
            column = column.push(widget::text::body("Loading genres…"));
        } else {
            column = column.push(self.genre_list());
        }

        if self.state.listing_loading {
            column = column.push(widget::text::body("Loading…"));
        } else if self.state.stations.is_empty() {
            let hint = match &self.state.listing {
                None => "Pick a genre or search to list stations.",
                Some(_) => "No stations found.",
            };
            column = column.push(widget::text::body(hint));
        } else {
            column = column.push(self.results_list(&self.state.stations));
        }

        column.into()
    }

    fn genre_list(&self) -> cosmic::Element<'_, Message> {
        let selected = match &self.state.listing {
            Some(ListingRequest::Genre(g)) => Some(g.as_str()),
            _ => None,
        };

        let mut list = widget::list_column().padding(0).spacing(0);
        for genre in &self.state.genres {
            let label = if Some(genre.as_str()) == selected {
                format!("● {genre}")
            } else {
                genre.clone()
            };
            list = list.add(
                widget::button::custom(widget::text::body(label))
                    .on_press(Message::SelectGenre(genre.clone()))
                    .width(Length::Fill),
            );
        }

        cosmic::iced_widget::scrollable(list.into_element())
            .height(Length::Fixed(120.0))
            .into()
    }

    fn results_list<'a>(&'a self, stations: &'a [Station]) -> cosmic::Element<'a, Message> {
        let mut list = widget::list_column().padding(0).spacing(0);

        for s in stations {
            let subtitle = station_subtitle(s);
            let station_ref = s.to_ref();
            let fav_text = if self.state.is_favorite(&s.id) { "★" } else { "☆" };

            let item = widget::row()
                .spacing(8)
                .push(
                    widget::button::custom(
                        widget::column()
                            .spacing(2)
                            .push(widget::text::body(&s.name))
                            .push(widget::text::caption(subtitle)),
                    )
                    .on_press(Message::PlayStation(station_ref.clone()))
                    .width(Length::Fill),
                )
                .push(widget::button::text(fav_text).on_press(Message::ToggleFavorite(station_ref)));

            list = list.add(item);
        }

        let height = f32::from(self.state.list_height);
        let scroll = cosmic::iced_widget::scrollable(list.into_element()).height(Length::Fixed(height));
        scroll.into()
    }
}

fn tab_button(label: &'static str, view: View, active: View) -> cosmic::Element<'static, Message> {
    let text = if view == active {
        format!("[{label}]")
    } else {
        label.to_string()
    };
    widget::button::text(text)
        .on_press(Message::ShowView(view))
        .into()
}

fn station_subtitle(s: &Station) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(g) = s.genre.as_ref().map(|x| x.trim()).filter(|x| !x.is_empty()) {
        parts.push(g.to_string());
    }
    if let Some(mt) = s.media_type.as_ref().map(|x| x.trim()).filter(|x| !x.is_empty()) {
        parts.push(mt.trim_start_matches("audio/").to_uppercase());
    }
    if let Some(br) = s.bitrate_kbps() {
        parts.push(format!("{br} kbps"));
    }
    if let Some(lc) = s.listener_count() {
        parts.push(format!("{lc} listeners"));
    }
    if let Some(ct) = s.current_track.as_ref().map(|x| x.trim()).filter(|x| !x.is_empty()) {
        parts.push(ct.to_string());
    }
    parts.join(" · ")
}
