use reqwest::Client;
use url::Url;

use super::announce::Announce;
use super::response::Response;
use super::URL_ENCODE_RESERVED;
use crate::error::tracker::Result;

/// An HTTP(S) tracker that we can request peers from and announce
/// transfer progress to.
#[derive(Clone)]
pub struct HttpTracker {
  /// The HTTP client; cheap to clone, connections are pooled.
  client: Client,
  url: Url,
}

impl HttpTracker {
  pub fn new(url: Url) -> Self {
    HttpTracker {
      client: Client::new(),
      url,
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Sends an announce request to the tracker with the specified
  /// parameters and parses the bencoded response.
  pub async fn announce(&self, params: Announce) -> Result<Response> {
    let mut query = vec![
      ("port", params.port.to_string()),
      ("downloaded", params.downloaded.to_string()),
      ("uploaded", params.uploaded.to_string()),
      ("left", params.left.to_string()),
      ("compact", "1".to_string()),
    ];

    if let Some(peer_count) = params.peer_count {
      query.push(("numwant", peer_count.to_string()));
    }
    if let Some(ip) = &params.ip {
      query.push(("ip", ip.to_string()));
    }
    if let Some(event) = &params.event {
      query.push(("event", event.as_str().to_string()));
    }

    // the info hash and peer id have to be encoded by hand: they are
    // raw bytes, not UTF-8, which the query serializer would mangle
    let url = format!(
      "{url}\
      ?info_hash={info_hash}\
      &peer_id={peer_id}",
      url = self.url,
      info_hash =
        percent_encoding::percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
      peer_id =
        percent_encoding::percent_encode(&params.peer_id, URL_ENCODE_RESERVED)
    );

    let resp = self
      .client
      .get(&url)
      .query(&query)
      .send()
      .await?
      .error_for_status()?
      .bytes()
      .await?;

    let resp = serde_bencode::from_bytes(&resp)?;
    Ok(resp)
  }
}
