//! Direct Telnet backend.
//!
//! A small IAC codec negotiates terminal-type, echo, suppress-go-ahead and
//! window-size; everything else is refused. One task owns the socket and
//! multiplexes backend output with input and resize commands.

use super::io::{BackendCommand, BackendIo, BackendPeer};
use super::DialTarget;
use crate::config::BackendConfig;
use crate::prompt::{match_prompt_and_submit, LOGIN_PROMPTS, PASSWORD_PROMPTS};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use webterm_core::{GatewayError, GatewayResult};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

const TERMINAL_TYPE: &[u8] = b"xterm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Verb(u8),
    Sb,
    SbIac,
}

/// Stateful IAC parser plus the option table.
#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
    sb: Vec<u8>,
    /// Options we have agreed to perform (WILL).
    local: [bool; 256],
    /// Options the peer performs (DO).
    remote: [bool; 256],
    rows: u16,
    cols: u16,
}

impl TelnetCodec {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            state: State::Data,
            sb: Vec::new(),
            local: [false; 256],
            remote: [false; 256],
            rows,
            cols,
        }
    }

    /// Options offered as soon as the socket is up.
    pub fn initial_requests(&mut self) -> Vec<u8> {
        self.local[OPT_TTYPE as usize] = true;
        self.local[OPT_NAWS as usize] = true;
        self.local[OPT_SGA as usize] = true;
        self.remote[OPT_ECHO as usize] = true;
        self.remote[OPT_SGA as usize] = true;
        vec![
            IAC, WILL, OPT_TTYPE, IAC, WILL, OPT_NAWS, IAC, WILL, OPT_SGA, IAC, DO, OPT_ECHO, IAC,
            DO, OPT_SGA,
        ]
    }

    /// Split `input` into terminal data and negotiation replies.
    pub fn decode(&mut self, input: &[u8], data: &mut Vec<u8>, reply: &mut Vec<u8>) {
        for &b in input {
            self.state = match self.state {
                State::Data if b == IAC => State::Iac,
                State::Data => {
                    data.push(b);
                    State::Data
                }
                State::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        State::Data
                    }
                    DO | DONT | WILL | WONT => State::Verb(b),
                    SB => {
                        self.sb.clear();
                        State::Sb
                    }
                    // NOP, GA, DM and friends carry no data
                    _ => State::Data,
                },
                State::Verb(verb) => {
                    self.negotiate(verb, b, reply);
                    State::Data
                }
                State::Sb if b == IAC => State::SbIac,
                State::Sb => {
                    self.sb.push(b);
                    State::Sb
                }
                State::SbIac => match b {
                    SE => {
                        self.subnegotiation(reply);
                        State::Data
                    }
                    IAC => {
                        self.sb.push(IAC);
                        State::Sb
                    }
                    _ => State::Sb,
                },
            };
        }
    }

    fn negotiate(&mut self, verb: u8, opt: u8, reply: &mut Vec<u8>) {
        trace!(verb, opt, "telnet negotiation");
        let i = opt as usize;
        match verb {
            DO => {
                let supported = matches!(opt, OPT_TTYPE | OPT_NAWS | OPT_SGA);
                if !supported {
                    reply.extend_from_slice(&[IAC, WONT, opt]);
                    return;
                }
                if !self.local[i] {
                    self.local[i] = true;
                    reply.extend_from_slice(&[IAC, WILL, opt]);
                }
                if opt == OPT_NAWS {
                    reply.extend_from_slice(&self.naws_subnegotiation());
                }
            }
            WILL => {
                let supported = matches!(opt, OPT_ECHO | OPT_SGA);
                if !supported {
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                } else if !self.remote[i] {
                    self.remote[i] = true;
                    reply.extend_from_slice(&[IAC, DO, opt]);
                }
            }
            DONT => {
                if self.local[i] {
                    self.local[i] = false;
                    reply.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            WONT => {
                if self.remote[i] {
                    self.remote[i] = false;
                    reply.extend_from_slice(&[IAC, DONT, opt]);
                }
            }
            _ => {}
        }
    }

    fn subnegotiation(&mut self, reply: &mut Vec<u8>) {
        if self.sb.first() == Some(&OPT_TTYPE) && self.sb.get(1) == Some(&TTYPE_SEND) {
            reply.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
            reply.extend_from_slice(TERMINAL_TYPE);
            reply.extend_from_slice(&[IAC, SE]);
        }
        self.sb.clear();
    }

    /// Record a new geometry and return the NAWS subnegotiation for it.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Vec<u8> {
        self.rows = rows;
        self.cols = cols;
        self.naws_subnegotiation()
    }

    fn naws_subnegotiation(&self) -> Vec<u8> {
        let mut out = vec![IAC, SB, OPT_NAWS];
        for b in self
            .cols
            .to_be_bytes()
            .into_iter()
            .chain(self.rows.to_be_bytes())
        {
            out.push(b);
            if b == IAC {
                out.push(IAC);
            }
        }
        out.extend_from_slice(&[IAC, SE]);
        out
    }
}

/// Double every IAC byte in outgoing user data.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

/// Dial the target and start the socket task.
pub async fn connect(cfg: &BackendConfig, target: &DialTarget) -> GatewayResult<BackendIo> {
    info!(host = %target.host, port = target.port, "telnet connect");

    let stream = tokio::time::timeout(
        cfg.dial_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| GatewayError::Dial("connect timed out".into()))?
    .map_err(|e| GatewayError::Dial(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let mut codec = TelnetCodec::new(target.rows, target.cols);
    let hello = codec.initial_requests();

    let (io, peer) = BackendIo::pair();
    tokio::spawn(socket_loop(stream, codec, hello, peer));
    debug!("telnet connection established");
    Ok(io)
}

async fn socket_loop(
    mut stream: TcpStream,
    mut codec: TelnetCodec,
    hello: Vec<u8>,
    peer: BackendPeer,
) {
    let BackendPeer {
        output,
        mut commands,
    } = peer;

    if let Err(e) = stream.write_all(&hello).await {
        warn!(error = %e, "telnet negotiation write failed");
        return;
    }

    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "telnet read ended");
                        break;
                    }
                };
                let mut data = Vec::new();
                let mut reply = Vec::new();
                codec.decode(&buf[..n], &mut data, &mut reply);
                if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                    break;
                }
                if !data.is_empty() && output.send(data).await.is_err() {
                    break;
                }
            }
            cmd = commands.recv() => {
                let bytes = match cmd {
                    Some(BackendCommand::Data(d)) => escape(&d),
                    Some(BackendCommand::Resize { rows, cols }) => codec.resize(rows, cols),
                    Some(BackendCommand::Close) | None => break,
                };
                if let Err(e) = stream.write_all(&bytes).await {
                    warn!(error = %e, "telnet write failed");
                    break;
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    debug!("telnet socket closed");
}

/// Auto-login when both a username and a password were supplied.
pub async fn auto_login(
    io: &mut BackendIo,
    target: &DialTarget,
    bound: Duration,
) -> GatewayResult<()> {
    let username = target.username.as_deref().filter(|u| !u.trim().is_empty());
    let password = target.password.as_deref().filter(|p| !p.trim().is_empty());
    let (Some(user), Some(pw)) = (username, password) else {
        return Ok(());
    };

    debug!(user, "attempt telnet auto login");
    let result = async {
        match_prompt_and_submit(bound, &mut io.output, LOGIN_PROMPTS, user, &io.input).await?;
        match_prompt_and_submit(bound, &mut io.output, PASSWORD_PROMPTS, pw, &io.input).await
    }
    .await;
    if let Err(e) = &result {
        warn!(error = %e, "telnet auto login failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use webterm_core::ConnectionType;

    #[test]
    fn doubled_iac_is_data() {
        let mut codec = TelnetCodec::new(24, 80);
        let (mut data, mut reply) = (Vec::new(), Vec::new());
        codec.decode(&[b'a', IAC, IAC, b'b'], &mut data, &mut reply);
        assert_eq!(data, vec![b'a', IAC, b'b']);
        assert!(reply.is_empty());
    }

    #[test]
    fn negotiation_replies() {
        let mut codec = TelnetCodec::new(24, 80);
        let (mut data, mut reply) = (Vec::new(), Vec::new());
        codec.decode(&[IAC, WILL, OPT_ECHO, IAC, DO, 99], &mut data, &mut reply);
        assert_eq!(reply, vec![IAC, DO, OPT_ECHO, IAC, WONT, 99]);

        // already agreed, no second reply
        reply.clear();
        codec.decode(&[IAC, WILL, OPT_ECHO], &mut data, &mut reply);
        assert!(reply.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    fn terminal_type_request() {
        let mut codec = TelnetCodec::new(24, 80);
        let (mut data, mut reply) = (Vec::new(), Vec::new());
        codec.decode(&[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE, b'x'], &mut data, &mut reply);
        let mut expected = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        expected.extend_from_slice(b"xterm");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(reply, expected);
        assert_eq!(data, b"x");
    }

    #[test]
    fn naws_escapes_iac() {
        let mut codec = TelnetCodec::new(24, 80);
        assert_eq!(
            codec.resize(24, 255),
            vec![IAC, SB, OPT_NAWS, 0, IAC, IAC, 0, 24, IAC, SE]
        );
    }

    #[test]
    fn split_sequence_across_reads() {
        let mut codec = TelnetCodec::new(24, 80);
        let (mut data, mut reply) = (Vec::new(), Vec::new());
        codec.decode(&[b'a', IAC], &mut data, &mut reply);
        codec.decode(&[DO, OPT_NAWS, b'b'], &mut data, &mut reply);
        assert_eq!(data, b"ab");
        assert_eq!(reply, vec![IAC, WILL, OPT_NAWS, IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);
    }

    async fn read_until(stream: &mut TcpStream, seen: &mut Vec<u8>, needle: &[u8]) {
        let mut buf = [0u8; 256];
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed early");
            seen.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn loopback_auto_login() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            s.write_all(&[IAC, DO, OPT_NAWS]).await.unwrap();
            s.write_all(b"host login: ").await.unwrap();
            read_until(&mut s, &mut seen, b"u\n").await;
            s.write_all(b"Password: ").await.unwrap();
            read_until(&mut s, &mut seen, b"pw\n").await;
            s.write_all(b"welcome\r\n").await.unwrap();
            seen
        });

        let target = DialTarget {
            connection_type: ConnectionType::Telnet,
            host: "127.0.0.1".into(),
            port,
            username: Some("u".into()),
            password: Some("pw".into()),
            rows: 24,
            cols: 80,
        };
        let mut io = connect(&BackendConfig::default(), &target).await.unwrap();
        auto_login(&mut io, &target, Duration::from_secs(2)).await.unwrap();

        let mut out = Vec::new();
        while !out.ends_with(b"welcome\r\n") {
            out.extend(io.output.next_chunk().await.unwrap());
        }
        assert_eq!(out, b"welcome\r\n");

        let seen = server.await.unwrap();
        let naws = [IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE];
        assert!(seen.windows(naws.len()).any(|w| w == naws));
        io.input.close();
    }
}
