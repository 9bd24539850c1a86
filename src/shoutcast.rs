use crate::models::{Station, StationListing};
use futures_util::StreamExt;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_BASE: &str = "http://yp.shoutcast.com";
const LISTING_PATH: &str = "/sbin/newxml.phtml";
const TUNEIN_PATH: &str = "/sbin/tunein-station.pls";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const CURRENT_TRACK_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_BODY_BYTES: usize = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ShoutcastError {
    /// The directory answered with a status above 202.
    #[error("Error ({code}): HTTP returned {reason}")]
    Http { code: u16, reason: String },

    #[error("Directory request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid directory URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Malformed directory XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("<{element}> is missing the `{attribute}` attribute")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },

    #[error("Directory response has no root element")]
    NoRoot,

    #[error("Directory response too large ({0} bytes)")]
    TooLarge(u64),
}

pub type Result<T> = std::result::Result<T, ShoutcastError>;

/// Minimal client for the Shoutcast station directory.
///
/// Every call is a single GET with no retry. Listings come back sorted by
/// station name.
#[derive(Debug, Clone)]
pub struct ShoutcastClient {
    http: reqwest::Client,
    base: Url,
}

impl ShoutcastClient {
    pub fn new() -> Result<Self> {
        Self::with_base(DEFAULT_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Pythagora/0.1 (MPD client)"));
        let http = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { http, base })
    }

    pub async fn genre_list(&self) -> Result<Vec<String>> {
        let body = self.send(LISTING_PATH, &[], DEFAULT_TIMEOUT).await?;
        parse_genres(&body)
    }

    pub async fn stations_for_genre(&self, genre: &str) -> Result<StationListing> {
        let body = self
            .send(LISTING_PATH, &[("genre", genre)], DEFAULT_TIMEOUT)
            .await?;
        parse_stations(&body)
    }

    pub async fn search(&self, pattern: &str) -> Result<StationListing> {
        let body = self
            .send(LISTING_PATH, &[("search", pattern)], DEFAULT_TIMEOUT)
            .await?;
        parse_stations(&body)
    }

    /// Stream URLs for a station, taken from its tune-in playlist.
    pub async fn station_urls(&self, station_id: &str) -> Result<Vec<String>> {
        let body = self
            .send(TUNEIN_PATH, &[("id", station_id)], DEFAULT_TIMEOUT)
            .await?;
        Ok(parse_pls(&body))
    }

    pub async fn current_track(&self, station_name: &str) -> Result<Option<String>> {
        let body = self
            .send(LISTING_PATH, &[("search", station_name)], CURRENT_TRACK_TIMEOUT)
            .await?;
        parse_current_track(&body)
    }

    async fn send(&self, path: &str, query: &[(&str, &str)], timeout: Duration) -> Result<String> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        debug!(%url, "shoutcast request");

        let resp = self.http.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        if status.as_u16() > 202 {
            return Err(ShoutcastError::Http {
                code: status.as_u16(),
                reason: reason_phrase(&resp),
            });
        }

        let bytes = read_limited(resp, MAX_BODY_BYTES).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The reason phrase the server actually sent, falling back to the canonical one.
fn reason_phrase(resp: &reqwest::Response) -> String {
    resp.extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .or_else(|| resp.status().canonical_reason())
        .unwrap_or("Unknown")
        .to_string()
}

async fn read_limited(resp: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    if let Some(len) = resp.content_length() {
        if len as usize > limit {
            return Err(ShoutcastError::TooLarge(len));
        }
    }

    let mut data: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if data.len().saturating_add(chunk.len()) > limit {
            return Err(ShoutcastError::TooLarge((data.len() + chunk.len()) as u64));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

pub fn parse_genres(xml: &str) -> Result<Vec<String>> {
    let mut genres = Vec::new();
    for_each_child(xml, |element, mut attrs| {
        let name = attrs
            .remove("name")
            .ok_or_else(|| missing(element, "name"))?;
        genres.push(name);
        Ok(())
    })?;
    genres.sort();
    Ok(genres)
}

/// Projects every child of the listing root except `tunein` into a
/// [`Station`].
pub fn parse_stations(xml: &str) -> Result<StationListing> {
    let mut listing = StationListing::default();
    for_each_child(xml, |element, mut attrs| {
        if element == "tunein" {
            listing.tunein_base = attrs.remove("base");
            return Ok(());
        }
        let station = Station {
            id: attrs.remove("id").ok_or_else(|| missing(element, "id"))?,
            name: attrs
                .remove("name")
                .ok_or_else(|| missing(element, "name"))?,
            bitrate: attrs.remove("br"),
            current_track: attrs.remove("ct"),
            genre: attrs.remove("genre"),
            listeners: attrs.remove("lc"),
            media_type: attrs.remove("mt"),
        };
        listing.stations.push(station);
        Ok(())
    })?;
    listing.stations.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(listing)
}

pub fn parse_current_track(xml: &str) -> Result<Option<String>> {
    let mut found: Option<Option<String>> = None;
    for_each_child(xml, |element, mut attrs| {
        if found.is_none() && element == "station" {
            found = Some(attrs.remove("ct"));
        }
        Ok(())
    })?;
    Ok(found.flatten())
}

pub fn parse_pls(body: &str) -> Vec<String> {
    body.lines()
        .filter(|line| line.starts_with("File"))
        .filter_map(|line| line.split_once('='))
        .map(|(_, url)| url.trim().to_string())
        .collect()
}

fn missing(element: &str, attribute: &'static str) -> ShoutcastError {
    ShoutcastError::MissingAttribute {
        element: element.to_string(),
        attribute,
    }
}

/// Calls `f` with the name and attributes of each direct child of the root.
fn for_each_child<F>(xml: &str, mut f: F) -> Result<()>
where
    F: FnMut(&str, HashMap<String, String>) -> Result<()>,
{
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut seen_root = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 0 {
                    seen_root = true;
                } else if depth == 1 {
                    visit(&e, &mut f)?;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    seen_root = true;
                } else if depth == 1 {
                    visit(&e, &mut f)?;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(ShoutcastError::NoRoot);
    }
    Ok(())
}

fn visit<F>(e: &BytesStart<'_>, f: &mut F) -> Result<()>
where
    F: FnMut(&str, HashMap<String, String>) -> Result<()>,
{
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    f(&name, attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const STATIONS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<stationlist>
  <tunein base="/sbin/tunein-station.pls"/>
  <station name="Zeta Jazz" mt="audio/mpeg" id="300" br="128" genre="Jazz" ct="Miles Davis - So What" lc="42"/>
  <station name="Alpha &amp; Omega" mt="audio/aacp" id="100" br="64" genre="Jazz" ct="" lc="7"/>
  <station name="Midnight Lounge" mt="audio/mpeg" id="200" br="192" genre="Jazz Lounge" lc="13"/>
</stationlist>"#;

    #[test]
    fn station_listing_is_sorted_and_skips_tunein() {
        let listing = parse_stations(STATIONS_XML).unwrap();
        let names: Vec<&str> = listing.stations.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha & Omega", "Midnight Lounge", "Zeta Jazz"]);
        assert_eq!(listing.tunein_base.as_deref(), Some("/sbin/tunein-station.pls"));
        assert!(listing.stations.iter().all(|s| s.id != ""));

        let midnight = &listing.stations[1];
        assert_eq!(midnight.id, "200");
        assert_eq!(midnight.bitrate_kbps(), Some(192));
        assert_eq!(midnight.current_track, None);
        assert_eq!(midnight.media_type.as_deref(), Some("audio/mpeg"));
    }

    #[test]
    fn station_without_id_is_an_error() {
        let xml = r#"<stationlist><station name="No Id" br="128"/></stationlist>"#;
        match parse_stations(xml) {
            Err(ShoutcastError::MissingAttribute { element, attribute }) => {
                assert_eq!(element, "station");
                assert_eq!(attribute, "id");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn genres_are_sorted() {
        let xml = r#"<genrelist><genre name="Rock"/><genre name="Ambient"/><genre name="Jazz"/></genrelist>"#;
        assert_eq!(parse_genres(xml).unwrap(), vec!["Ambient", "Jazz", "Rock"]);
    }

    #[test]
    fn nested_elements_are_not_children() {
        let xml = r#"<stationlist><station name="B" id="2"><extra name="x" id="9"/></station><station name="A" id="1"/></stationlist>"#;
        let listing = parse_stations(xml).unwrap();
        assert_eq!(listing.stations.len(), 2);
        assert_eq!(listing.stations[0].id, "1");
    }

    #[test]
    fn empty_body_has_no_root() {
        assert!(matches!(parse_genres("   "), Err(ShoutcastError::NoRoot)));
    }

    #[test]
    fn pls_file_lines_are_extracted_in_order() {
        let body = "[playlist]\r\nnumberofentries=3\r\nFile1=http://a.example:8000/\r\nTitle1=A\r\nFile2=http://b.example/stream?x=1\r\nFile3=http://c.example/\r\nLength1=-1\r\nVersion=2\r\n";
        assert_eq!(
            parse_pls(body),
            vec![
                "http://a.example:8000/",
                "http://b.example/stream?x=1",
                "http://c.example/",
            ]
        );
    }

    #[test]
    fn current_track_comes_from_first_station() {
        assert_eq!(
            parse_current_track(STATIONS_XML).unwrap().as_deref(),
            Some("Miles Davis - So What")
        );
        assert_eq!(parse_current_track("<stationlist/>").unwrap(), None);
    }

    #[test]
    fn http_error_display() {
        let err = ShoutcastError::Http {
            code: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(err.to_string(), "Error (404): HTTP returned Not Found");
    }

    #[tokio::test]
    async fn fetches_stations_for_genre() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sbin/newxml.phtml"))
            .and(query_param("genre", "Jazz"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STATIONS_XML))
            .mount(&server)
            .await;

        let client = ShoutcastClient::with_base(&server.uri()).unwrap();
        let listing = client.stations_for_genre("Jazz").await.unwrap();
        assert_eq!(listing.stations.len(), 3);
        assert_eq!(listing.stations[0].name, "Alpha & Omega");
    }

    #[tokio::test]
    async fn search_pattern_is_query_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sbin/newxml.phtml"))
            .and(query_param("search", "drum & bass"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<stationlist><station name="DnB" id="5"/></stationlist>"#),
            )
            .mount(&server)
            .await;

        let client = ShoutcastClient::with_base(&server.uri()).unwrap();
        let listing = client.search("drum & bass").await.unwrap();
        assert_eq!(listing.stations[0].id, "5");
    }

    #[tokio::test]
    async fn status_above_202_is_a_domain_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(203))
            .mount(&server)
            .await;

        let client = ShoutcastClient::with_base(&server.uri()).unwrap();
        match client.genre_list().await {
            Err(ShoutcastError::Http { code, reason }) => {
                assert_eq!(code, 203);
                assert_eq!(reason, "Non-Authoritative Information");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_reason_phrase_is_kept() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 520 Origin Trouble\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let client = ShoutcastClient::with_base(&format!("http://{addr}")).unwrap();
        match client.genre_list().await {
            Err(ShoutcastError::Http { code, reason }) => {
                assert_eq!(code, 520);
                assert_eq!(reason, "Origin Trouble");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(202).set_body_string(r#"<genrelist><genre name="Pop"/></genrelist>"#),
            )
            .mount(&server)
            .await;

        let client = ShoutcastClient::with_base(&server.uri()).unwrap();
        assert_eq!(client.genre_list().await.unwrap(), vec!["Pop"]);
    }

    #[tokio::test]
    async fn resolves_station_urls_from_tunein_playlist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sbin/tunein-station.pls"))
            .and(query_param("id", "1234"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "[playlist]\nnumberofentries=2\nFile1=http://one.example/\nFile2=http://two.example/\n",
            ))
            .mount(&server)
            .await;

        let client = ShoutcastClient::with_base(&server.uri()).unwrap();
        let urls = client.station_urls("1234").await.unwrap();
        assert_eq!(urls, vec!["http://one.example/", "http://two.example/"]);
    }
}
