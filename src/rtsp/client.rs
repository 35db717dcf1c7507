//! Blocking RTSP client for camera sessions.
//!
//! Lives on the camera's reader thread: DESCRIBE/SETUP/PLAY over TCP,
//! then RTP either interleaved on the same connection or over a UDP
//! socket pair. Timeouts ride on SO_RCVTIMEO so the probe budget and
//! cooperative stop both work without async machinery.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use base64::Engine;
use rtsp_types as rtsp;
use tracing::{debug, trace};

use crate::config::RtspTransport;
use crate::error::{AppError, Result};

const RTSP_DEFAULT_PORT: u16 = 554;
const USER_AGENT: &str = concat!("camgate/", env!("CARGO_PKG_VERSION"));
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
const UDP_PORT_ATTEMPTS: u32 = 16;

/// One unit of inbound session data.
pub enum SessionData {
    /// An RTP packet from the video substream.
    Rtp(Vec<u8>),
    /// RTCP or an RTSP message we only needed to consume.
    Other,
}

/// Blocking RTSP client bound to one camera URL.
pub struct RtspClient {
    stream: TcpStream,
    /// Request URL with userinfo stripped.
    url: rtsp::Url,
    /// Precomputed `Basic` authorization value, when the URL carried
    /// credentials.
    authorization: Option<String>,
    cseq: u32,
    session: Option<String>,
    session_timeout: Duration,
    content_base: Option<String>,
    transport: RtspTransport,
    rtp_socket: Option<UdpSocket>,
    rtcp_socket: Option<UdpSocket>,
    buffer: Vec<u8>,
    last_keepalive: Instant,
    supports_get_parameter: bool,
}

impl RtspClient {
    /// Connect the control channel. `timeout` bounds the TCP connect
    /// and becomes the initial read timeout.
    pub fn connect(url_str: &str, transport: RtspTransport, timeout: Duration) -> Result<Self> {
        let mut url =
            rtsp::Url::parse(url_str).map_err(|e| AppError::Rtsp(format!("bad RTSP URL: {}", e)))?;
        if url.scheme() != "rtsp" {
            return Err(AppError::Rtsp(format!("not an rtsp:// URL: {}", url.scheme())));
        }

        let authorization = if !url.username().is_empty() || url.password().is_some() {
            let raw = format!(
                "{}:{}",
                percent_decode(url.username()),
                percent_decode(url.password().unwrap_or(""))
            );
            let value = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
            );
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some(value)
        } else {
            None
        };

        let host = url
            .host_str()
            .ok_or_else(|| AppError::Rtsp("RTSP URL has no host".into()))?;
        let port = url.port().unwrap_or(RTSP_DEFAULT_PORT);

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AppError::Rtsp(format!("cannot resolve {}", host)))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        debug!("RTSP control channel connected to {}", addr);

        Ok(Self {
            stream,
            url,
            authorization,
            cseq: 0,
            session: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            content_base: None,
            transport,
            rtp_socket: None,
            rtcp_socket: None,
            buffer: Vec::with_capacity(16 * 1024),
            last_keepalive: Instant::now(),
            supports_get_parameter: false,
        })
    }

    /// Adjust the read timeout, e.g. to the remaining probe budget.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let timeout = timeout.max(Duration::from_millis(50));
        self.stream.set_read_timeout(Some(timeout))?;
        if let Some(ref sock) = self.rtp_socket {
            sock.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    /// OPTIONS, mostly to learn whether GET_PARAMETER keepalives are
    /// accepted.
    pub fn options(&mut self) -> Result<()> {
        let response = self.exchange(rtsp::Method::Options, None, vec![])?;
        if let Some(public) = header(&response, "public") {
            self.supports_get_parameter = public.to_ascii_uppercase().contains("GET_PARAMETER");
        }
        Ok(())
    }

    /// DESCRIBE; returns the SDP body.
    pub fn describe(&mut self) -> Result<Vec<u8>> {
        let response = self.exchange(
            rtsp::Method::Describe,
            None,
            vec![("Accept".to_string(), "application/sdp".to_string())],
        )?;
        self.content_base = header(&response, "content-base")
            .or_else(|| header(&response, "content-location"))
            .map(|s| s.trim_end_matches('/').to_string());
        let body = response.into_body();
        if body.is_empty() {
            return Err(AppError::Rtsp("DESCRIBE returned an empty body".into()));
        }
        Ok(body)
    }

    /// SETUP the video substream given its control attribute.
    pub fn setup(&mut self, control: Option<&str>) -> Result<()> {
        let uri = self.control_url(control);

        let transport_value = match self.transport {
            RtspTransport::Tcp => "RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
            RtspTransport::Udp => {
                let (rtp, rtcp) = bind_udp_pair()?;
                let value = format!(
                    "RTP/AVP;unicast;client_port={}-{}",
                    rtp.local_addr()?.port(),
                    rtcp.local_addr()?.port()
                );
                rtp.set_read_timeout(self.stream.read_timeout()?)?;
                self.rtp_socket = Some(rtp);
                self.rtcp_socket = Some(rtcp);
                value
            }
        };

        let response = self.exchange_uri(
            rtsp::Method::Setup,
            &uri,
            vec![("Transport".to_string(), transport_value)],
        )?;

        let session_header = header(&response, "session")
            .ok_or_else(|| AppError::Rtsp("SETUP response carries no session".into()))?;
        let mut parts = session_header.split(';');
        self.session = parts.next().map(|s| s.trim().to_string());
        for part in parts {
            if let Some((key, value)) = part.trim().split_once('=') {
                if key.eq_ignore_ascii_case("timeout") {
                    if let Ok(secs) = value.trim().parse::<u64>() {
                        self.session_timeout = Duration::from_secs(secs.max(10));
                    }
                }
            }
        }
        debug!(
            "RTSP substream set up (session {}, timeout {:?})",
            self.session.as_deref().unwrap_or("?"),
            self.session_timeout
        );
        Ok(())
    }

    /// PLAY; after this, `read_data` yields RTP packets.
    pub fn play(&mut self) -> Result<()> {
        self.exchange(
            rtsp::Method::Play,
            None,
            vec![("Range".to_string(), "npt=0.000-".to_string())],
        )?;
        self.last_keepalive = Instant::now();
        Ok(())
    }

    /// Best-effort TEARDOWN. The socket closes either way.
    pub fn teardown(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.send_request(rtsp::Method::Teardown, None, vec![]) {
                trace!("TEARDOWN not delivered: {}", e);
            }
        }
    }

    /// Read the next unit of session data. Also services the session
    /// keepalive. Timeouts surface as `Io` with `WouldBlock`/`TimedOut`.
    pub fn read_data(&mut self) -> Result<SessionData> {
        self.maybe_keepalive()?;
        match self.transport {
            RtspTransport::Tcp => self.read_interleaved(),
            RtspTransport::Udp => self.read_udp(),
        }
    }

    fn read_udp(&mut self) -> Result<SessionData> {
        let socket = self
            .rtp_socket
            .as_ref()
            .ok_or_else(|| AppError::Rtsp("UDP transport without a socket".into()))?;
        let mut packet = vec![0u8; 65536];
        let len = socket.recv(&mut packet)?;
        packet.truncate(len);
        // drain any pending control-channel bytes without blocking
        self.drain_control_channel();
        Ok(SessionData::Rtp(packet))
    }

    fn read_interleaved(&mut self) -> Result<SessionData> {
        loop {
            if let Some(data) = self.take_interleaved_frame()? {
                return Ok(data);
            }
            if self.take_rtsp_message()? {
                return Ok(SessionData::Other);
            }
            self.fill_buffer()?;
        }
    }

    /// Pop one `$`-framed interleaved frame from the buffer, if whole.
    fn take_interleaved_frame(&mut self) -> Result<Option<SessionData>> {
        if self.buffer.first() != Some(&b'$') {
            return Ok(None);
        }
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let channel = self.buffer[1];
        let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(0..4 + len);
        if channel == 0 {
            Ok(Some(SessionData::Rtp(payload)))
        } else {
            // RTCP or an unknown channel
            Ok(Some(SessionData::Other))
        }
    }

    /// Consume one complete RTSP message sitting in the buffer
    /// (keepalive responses, server requests). Returns true if one was
    /// consumed.
    fn take_rtsp_message(&mut self) -> Result<bool> {
        if self.buffer.is_empty() || self.buffer[0] == b'$' {
            return Ok(false);
        }
        let parsed: std::result::Result<(rtsp::Message<Vec<u8>>, usize), rtsp::ParseError> =
            rtsp::Message::parse(self.buffer.as_slice());
        match parsed {
            Ok((message, consumed)) => {
                self.buffer.drain(0..consumed);
                match message {
                    rtsp::Message::Response(_) => {
                        trace!("consumed in-stream RTSP response");
                    }
                    rtsp::Message::Request(req) => {
                        trace!("ignoring server-initiated {:?}", req.method());
                    }
                    rtsp::Message::Data(_) => {}
                }
                Ok(true)
            }
            Err(rtsp::ParseError::Incomplete) => Ok(false),
            Err(e) => Err(AppError::Rtsp(format!("garbled control channel: {:?}", e))),
        }
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(AppError::Rtsp("RTSP connection closed by camera".into()));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn drain_control_channel(&mut self) {
        // opportunistic: keepalive responses must not pile up in the
        // kernel buffer while data flows over UDP
        let _ = self.stream.set_nonblocking(true);
        let mut chunk = [0u8; 4096];
        while let Ok(n) = self.stream.read(&mut chunk) {
            if n == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        let _ = self.stream.set_nonblocking(false);
        while self.take_rtsp_message().unwrap_or(false) {}
    }

    /// Send a keepalive when half the session timeout has elapsed. The
    /// response is consumed by the normal read path.
    fn maybe_keepalive(&mut self) -> Result<()> {
        if self.session.is_none() || self.last_keepalive.elapsed() < self.session_timeout / 2 {
            return Ok(());
        }
        let method = if self.supports_get_parameter {
            rtsp::Method::GetParameter
        } else {
            rtsp::Method::Options
        };
        self.send_request(method, None, vec![])?;
        self.last_keepalive = Instant::now();
        Ok(())
    }

    // ---- request/response plumbing ----

    fn exchange(
        &mut self,
        method: rtsp::Method,
        uri: Option<&str>,
        headers: Vec<(String, String)>,
    ) -> Result<rtsp::Response<Vec<u8>>> {
        let uri = uri.map(|s| s.to_string()).unwrap_or_else(|| self.url.to_string());
        self.exchange_uri(method, &uri, headers)
    }

    fn exchange_uri(
        &mut self,
        method: rtsp::Method,
        uri: &str,
        headers: Vec<(String, String)>,
    ) -> Result<rtsp::Response<Vec<u8>>> {
        let cseq = self.send_request_uri(method, uri, headers)?;
        self.read_response(cseq)
    }

    fn send_request(
        &mut self,
        method: rtsp::Method,
        uri: Option<&str>,
        headers: Vec<(String, String)>,
    ) -> Result<u32> {
        let uri = uri.map(|s| s.to_string()).unwrap_or_else(|| self.url.to_string());
        self.send_request_uri(method, &uri, headers)
    }

    fn send_request_uri(
        &mut self,
        method: rtsp::Method,
        uri: &str,
        headers: Vec<(String, String)>,
    ) -> Result<u32> {
        self.cseq += 1;
        let cseq = self.cseq;

        let url = rtsp::Url::parse(uri)
            .map_err(|e| AppError::Rtsp(format!("bad request URI {}: {}", uri, e)))?;

        let mut builder = rtsp::Request::builder(method, rtsp::Version::V1_0)
            .request_uri(url)
            .header(rtsp::headers::CSEQ, cseq.to_string())
            .header(rtsp::headers::USER_AGENT, USER_AGENT);

        if let Some(ref auth) = self.authorization {
            builder = builder.header(rtsp::headers::AUTHORIZATION, auth.as_str());
        }
        if let Some(ref session) = self.session {
            builder = builder.header(rtsp::headers::SESSION, session.as_str());
        }
        for (name, value) in headers {
            let header_name = rtsp::HeaderName::try_from(name.as_str())
                .map_err(|e| AppError::Rtsp(format!("invalid header {}: {}", name, e)))?;
            builder = builder.header(header_name, value);
        }

        let request = builder.build(rtsp::Empty);
        let mut data = Vec::new();
        request
            .write(&mut data)
            .map_err(|e| AppError::Rtsp(format!("failed to serialize request: {}", e)))?;
        self.stream.write_all(&data)?;
        Ok(cseq)
    }

    /// Read until the response matching `cseq` arrives, skipping any
    /// interleaved data frames and stale responses in between.
    fn read_response(&mut self, cseq: u32) -> Result<rtsp::Response<Vec<u8>>> {
        loop {
            // interleaved media may already be flowing during teardown
            // of a previous state; frames are discarded here
            while self.take_interleaved_frame()?.is_some() {}

            if !self.buffer.is_empty() && self.buffer[0] != b'$' {
                let parsed: std::result::Result<(rtsp::Message<Vec<u8>>, usize), rtsp::ParseError> =
                    rtsp::Message::parse(self.buffer.as_slice());
                match parsed {
                    Ok((message, consumed)) => {
                        self.buffer.drain(0..consumed);
                        match message {
                            rtsp::Message::Response(response) => {
                                let matches = header_of(&response, "cseq")
                                    .and_then(|v| v.trim().parse::<u32>().ok())
                                    .map(|c| c == cseq)
                                    .unwrap_or(true);
                                if !matches {
                                    trace!("skipping stale response");
                                    continue;
                                }
                                if response.status() != rtsp::StatusCode::Ok {
                                    return Err(AppError::Rtsp(format!(
                                        "camera answered {:?} {}",
                                        response.status(),
                                        response.reason_phrase()
                                    )));
                                }
                                return Ok(response);
                            }
                            rtsp::Message::Request(req) => {
                                trace!("ignoring server-initiated {:?}", req.method());
                                continue;
                            }
                            rtsp::Message::Data(_) => continue,
                        }
                    }
                    Err(rtsp::ParseError::Incomplete) => {}
                    Err(e) => {
                        return Err(AppError::Rtsp(format!("garbled response: {:?}", e)));
                    }
                }
            }
            self.fill_buffer()?;
        }
    }

    /// Resolve the SETUP URL from the SDP control attribute.
    fn control_url(&self, control: Option<&str>) -> String {
        let base = self
            .content_base
            .clone()
            .unwrap_or_else(|| self.url.to_string());
        match control {
            None | Some("*") => base,
            Some(c) if c.starts_with("rtsp://") => c.to_string(),
            Some(c) => format!("{}/{}", base.trim_end_matches('/'), c),
        }
    }
}

impl Drop for RtspClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn header(response: &rtsp::Response<Vec<u8>>, name: &str) -> Option<String> {
    header_of(response, name)
}

fn header_of(response: &rtsp::Response<Vec<u8>>, name: &str) -> Option<String> {
    response
        .headers()
        .find(|(n, _)| n.to_string().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.to_string())
}

/// Bind an even/odd UDP port pair for RTP/RTCP.
fn bind_udp_pair() -> Result<(UdpSocket, UdpSocket)> {
    for _ in 0..UDP_PORT_ATTEMPTS {
        let probe = UdpSocket::bind(("0.0.0.0", 0))?;
        let port = probe.local_addr()?.port() & !1;
        drop(probe);
        let rtp = match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        match UdpSocket::bind(("0.0.0.0", port + 1)) {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(_) => continue,
        }
    }
    Err(AppError::Rtsp("could not bind an RTP/RTCP port pair".into()))
}

fn percent_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            match (
                hi.and_then(|h| (h as char).to_digit(16)),
                lo.and_then(|l| (l as char).to_digit(16)),
            ) {
                (Some(h), Some(l)) => out.push(((h * 16 + l) as u8) as char),
                _ => {
                    out.push('%');
                    if let Some(h) = hi {
                        out.push(h as char);
                    }
                    if let Some(l) = lo {
                        out.push(l as char);
                    }
                }
            }
        } else {
            out.push(b as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("p%40ss"), "p@ss");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }

    #[test]
    fn udp_pair_is_even_odd() {
        let (rtp, rtcp) = bind_udp_pair().unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
    }
}
