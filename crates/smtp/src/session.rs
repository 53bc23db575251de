/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The ESMTP server session: one instance per accepted connection, owning
//! its `Conn` exclusively. The driver loop in [`Session::run`] reads one
//! command line at a time and dispatches through [`Session::handle_command`],
//! which never panics on peer input and always returns a tagged outcome
//! instead of raising an exception.

use std::{net::IpAddr, sync::Arc, time::Instant};

use base64::Engine;
use tokio::sync::mpsc;

use authentication::{dkim, dmarc, spf};
use common::{DkimSigner, Envelope, FannstFlags, MailAuthConfig, VerifyStrategy};
use directory::Directory;
use dns::Resolver;
use message::{EmailAddress, Header, MimeMessage};
use utils::{listener::ServerInstance, Conn};

use crate::codec::{self, Command};
use crate::handoff::{AuthResultsSummary, LocalTarget, SessionHandoff};

const MAX_COMMAND_LINE: usize = 8192;

/// States a conversation may be in. `AwaitingHelo` is both the initial state
/// (after the banner) and the state a successful `STARTTLS` resets to: the
/// peer must (re-)issue `EHLO`/`HELO` before any envelope command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingHelo,
    Helloed,
    MailReceived,
    RcptReceived,
    DataStreaming,
    Quit,
}

/// The result of handling one command. Response writing and connection
/// teardown are centralized in [`Session::run`]; handlers only describe
/// what happened.
pub enum CommandOutcome {
    Continue,
    Respond { code: u16, lines: Vec<String> },
    /// `DATA` was accepted; the driver sends `354` and switches to the raw
    /// message read.
    EnterData,
    /// `STARTTLS` was accepted; the driver sends `220`, performs the
    /// handshake, and resets the envelope.
    UpgradeTls,
    Close { code: u16, text: String },
}

impl CommandOutcome {
    fn respond(code: u16, text: impl Into<String>) -> Self {
        CommandOutcome::Respond { code, lines: vec![text.into()] }
    }
}

#[derive(Debug, Clone)]
pub struct SessionAddress {
    pub address: String,
    pub address_lcase: String,
    pub domain: String,
}

impl SessionAddress {
    /// `raw` is the content between `<` and `>`; empty denotes the null
    /// reverse-path used on bounce/DSN messages.
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return Some(SessionAddress { address: String::new(), address_lcase: String::new(), domain: String::new() });
        }
        let parsed = EmailAddress::new(None, raw).ok()?;
        let address = parsed.address();
        Some(SessionAddress {
            address_lcase: address.to_ascii_lowercase(),
            domain: parsed.domain.to_ascii_lowercase(),
            address,
        })
    }

    fn is_null(&self) -> bool {
        self.address.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SessionData {
    pub remote_ip: IpAddr,
    pub helo_domain: String,
    pub esmtp: bool,
    pub mail_from: Option<SessionAddress>,
    pub rcpt_to: Vec<SessionAddress>,
    pub authenticated_as: Option<String>,
    pub su_granted: bool,
    pub messages_sent: u32,
}

impl SessionData {
    pub fn new(remote_ip: IpAddr) -> Self {
        SessionData {
            remote_ip,
            helo_domain: String::new(),
            esmtp: true,
            mail_from: None,
            rcpt_to: Vec::new(),
            authenticated_as: None,
            su_granted: false,
            messages_sent: 0,
        }
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

/// Session-tunable policy not already carried by the immutable
/// [`ServerInstance`].
#[derive(Debug, Clone)]
pub struct SessionParameters {
    pub auth_require_for_local_sender: bool,
    pub rcpt_max: usize,
}

pub struct Session {
    pub state: State,
    pub instance: Arc<ServerInstance>,
    pub conn: Conn,
    pub data: SessionData,
    pub params: SessionParameters,
    pub directory: Arc<dyn Directory>,
    pub resolver: Arc<Resolver>,
    pub mail_auth: MailAuthConfig,
    pub dkim_signer: Option<Arc<DkimSigner>>,
    pub handoff_tx: mpsc::Sender<SessionHandoff>,
    pub server_domain: String,
    pub bounce_sender: String,
    pub session_id: u64,
    sasl_pending: bool,
}

impl Envelope for Session {
    fn remote_ip(&self) -> IpAddr {
        self.data.remote_ip
    }
    fn sender_domain(&self) -> &str {
        self.data.mail_from.as_ref().map(|a| a.domain.as_str()).unwrap_or("")
    }
    fn sender(&self) -> &str {
        self.data.mail_from.as_ref().map(|a| a.address.as_str()).unwrap_or("")
    }
    fn rcpt_domain(&self) -> &str {
        self.data.rcpt_to.last().map(|a| a.domain.as_str()).unwrap_or("")
    }
    fn rcpt(&self) -> &str {
        self.data.rcpt_to.last().map(|a| a.address.as_str()).unwrap_or("")
    }
    fn helo_domain(&self) -> &str {
        &self.data.helo_domain
    }
    fn authenticated_as(&self) -> &str {
        self.data.authenticated_as.as_deref().unwrap_or("")
    }
    fn listener_id(&self) -> u16 {
        self.instance.listener_id
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: Arc<ServerInstance>,
        conn: Conn,
        remote_ip: IpAddr,
        params: SessionParameters,
        directory: Arc<dyn Directory>,
        resolver: Arc<Resolver>,
        mail_auth: MailAuthConfig,
        dkim_signer: Option<Arc<DkimSigner>>,
        handoff_tx: mpsc::Sender<SessionHandoff>,
        server_domain: String,
        bounce_sender: String,
    ) -> Self {
        Session {
            state: State::AwaitingHelo,
            instance,
            conn,
            data: SessionData::new(remote_ip),
            params,
            directory,
            resolver,
            mail_auth,
            dkim_signer,
            handoff_tx,
            server_domain,
            bounce_sender,
            session_id: trc::next_session_id(),
            sasl_pending: false,
        }
    }

    fn banner(&self) -> String {
        format!("{} ESMTP Fannst Mail Server ready", self.instance.hostname)
    }

    /// Drives the conversation to completion: banner, then command loop
    /// until `QUIT` or a fatal I/O error. Every suspension point (read,
    /// write, TLS handshake, DNS/store RPC inside command handlers) is
    /// `.await`ed; nothing blocks the runtime.
    pub async fn run(&mut self) {
        trc::event!(DEBUG, trc::EventType::ConnectionStart, "remote_ip" = self.data.remote_ip, "listener" = self.instance.listener_id);

        if self.conn.write_all(codec::format_single(220, &self.banner()).as_bytes()).await.is_err() {
            return;
        }

        loop {
            let line = match self.conn.read_to_delim(b"\r\n", MAX_COMMAND_LINE).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(utils::net::Error::LimitExceeded) => {
                    let _ = self
                        .conn
                        .write_all(codec::format_single(500, "Line too long").as_bytes())
                        .await;
                    continue;
                }
                Err(_) => break,
            };

            let outcome = if self.sasl_pending {
                self.sasl_pending = false;
                self.handle_sasl_response(&line).await
            } else {
                self.handle_command(&line).await
            };

            match outcome {
                CommandOutcome::Continue => {}
                CommandOutcome::Respond { code, lines } => {
                    let text = if lines.len() == 1 {
                        codec::format_single(code, &lines[0])
                    } else {
                        codec::format_multi(code, &lines)
                    };
                    trc::event!(DEBUG, trc::EventType::ResponseSent, "code" = code);
                    if self.conn.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                CommandOutcome::EnterData => {
                    if self.conn.write_all(codec::format_single(354, "Start mail input; end with <CRLF>.<CRLF>").as_bytes()).await.is_err() {
                        break;
                    }
                    let response = self.receive_data().await;
                    let text = codec::format_single(response.0, &response.1);
                    if self.conn.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                CommandOutcome::UpgradeTls => {
                    if self.conn.write_all(codec::format_single(220, "Go ahead").as_bytes()).await.is_err() {
                        break;
                    }
                    match &self.instance.tls_acceptor {
                        Some(acceptor) => {
                            trc::event!(DEBUG, trc::EventType::TlsHandshakeStart, "remote_ip" = self.data.remote_ip);
                            if self.conn.upgrade_server(acceptor).await.is_err() {
                                trc::event!(WARN, trc::EventType::TlsHandshakeError, "remote_ip" = self.data.remote_ip);
                                break;
                            }
                            trc::event!(DEBUG, trc::EventType::TlsHandshakeSuccess, "remote_ip" = self.data.remote_ip);
                            self.state = State::AwaitingHelo;
                            self.data.reset_envelope();
                            self.data.helo_domain.clear();
                        }
                        None => break,
                    }
                }
                CommandOutcome::Close { code, text } => {
                    let _ = self.conn.write_all(codec::format_single(code, &text).as_bytes()).await;
                    break;
                }
            }

            if matches!(self.state, State::Quit) {
                break;
            }
        }

        trc::event!(DEBUG, trc::EventType::ConnectionEnd, "remote_ip" = self.data.remote_ip);
    }

    pub async fn handle_command(&mut self, line: &str) -> CommandOutcome {
        trc::event!(DEBUG, trc::EventType::CommandReceived, "line" = line);
        let command = match codec::parse_command(line) {
            Ok(c) => c,
            Err(_) => return CommandOutcome::respond(501, "Syntax error in parameters or arguments"),
        };

        match command {
            Command::Helo { domain } => self.handle_helo(domain, false),
            Command::Ehlo { domain } => self.handle_helo(domain, true),
            Command::StartTls => self.handle_starttls(),
            Command::Auth { mechanism, initial } => self.handle_auth(mechanism, initial).await,
            Command::MailFrom { address, params } => self.handle_mail_from(address, params).await,
            Command::RcptTo { address, params } => self.handle_rcpt_to(address, params).await,
            Command::Data => self.handle_data_command(),
            Command::Quit => CommandOutcome::Close { code: 221, text: format!("{} closing connection", self.instance.hostname) },
            Command::Help => CommandOutcome::respond(214, "HELO EHLO STARTTLS AUTH MAIL RCPT DATA RSET NOOP QUIT SU FCAPA"),
            Command::Noop => CommandOutcome::respond(250, "OK"),
            Command::Rset => {
                self.data.reset_envelope();
                if matches!(self.state, State::MailReceived | State::RcptReceived | State::DataStreaming) {
                    self.state = State::Helloed;
                }
                CommandOutcome::respond(250, "OK")
            }
            Command::Su => self.handle_su().await,
            Command::Fcapa => CommandOutcome::Respond { code: 250, lines: vec!["SU".to_string(), "X-FANNST-FLAGS".to_string()] },
            Command::Other(_) => CommandOutcome::respond(502, "Command not implemented"),
        }
    }

    fn handle_helo(&mut self, domain: String, esmtp: bool) -> CommandOutcome {
        if domain.is_empty() {
            return CommandOutcome::respond(501, "Syntax error: domain required");
        }
        self.data.helo_domain = domain;
        self.data.esmtp = esmtp;
        self.data.reset_envelope();
        self.state = State::Helloed;

        if !esmtp {
            return CommandOutcome::respond(250, &self.instance.hostname.clone());
        }
        CommandOutcome::Respond { code: 250, lines: self.ehlo_capabilities() }
    }

    fn ehlo_capabilities(&self) -> Vec<String> {
        let mut caps = vec![self.instance.hostname.clone()];
        caps.push("AUTH PLAIN".to_string());
        if self.instance.offers_starttls() && !self.conn.is_tls() {
            caps.push("STARTTLS".to_string());
        }
        caps.push("SMTPUTF8".to_string());
        caps.push(format!("SIZE {}", self.instance.max_message_size));
        caps.push("ENHANCEDSTATUSCODES".to_string());
        caps
    }

    fn handle_starttls(&mut self) -> CommandOutcome {
        if self.conn.is_tls() {
            return CommandOutcome::respond(503, "Bad sequence of commands: already using TLS");
        }
        if !self.instance.offers_starttls() {
            return CommandOutcome::respond(502, "Command not implemented");
        }
        CommandOutcome::UpgradeTls
    }

    async fn handle_auth(&mut self, mechanism: String, initial: Option<String>) -> CommandOutcome {
        if !matches!(self.state, State::Helloed) {
            return CommandOutcome::respond(503, "Bad sequence of commands");
        }
        if mechanism != "PLAIN" {
            return CommandOutcome::respond(504, "Unrecognized authentication type");
        }
        match initial {
            Some(token) => self.finish_auth_plain(&token).await,
            None => {
                self.sasl_pending = true;
                CommandOutcome::respond(334, "")
            }
        }
    }

    async fn handle_sasl_response(&mut self, line: &str) -> CommandOutcome {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "*" {
            return CommandOutcome::respond(501, "Authentication cancelled");
        }
        self.finish_auth_plain(line).await
    }

    /// Decodes `\0authzid\0authcid\0passwd` and verifies against the
    /// directory. A missing account and a wrong password are indistinguishable
    /// to the peer: both yield `535`.
    async fn finish_auth_plain(&mut self, b64_token: &str) -> CommandOutcome {
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(b64_token) else {
            return CommandOutcome::respond(501, "Invalid base64 authentication token");
        };
        let parts: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
        let [_authzid, authcid, passwd] = parts.as_slice() else {
            return CommandOutcome::respond(501, "Malformed AUTH PLAIN token");
        };
        let authcid = String::from_utf8_lossy(authcid).into_owned();
        let passwd = String::from_utf8_lossy(passwd).into_owned();

        let Some((username, domain)) = authcid.split_once('@') else {
            return CommandOutcome::respond(535, "Authentication failed");
        };

        match self.directory.authenticate(domain, username, &passwd).await {
            Ok(Some(_)) => {
                self.data.authenticated_as = Some(authcid.to_ascii_lowercase());
                trc::event!(INFO, trc::EventType::AuthSuccess, "account" = authcid);
                CommandOutcome::respond(235, "Authentication successful")
            }
            Ok(None) => {
                trc::event!(WARN, trc::EventType::AuthFailure, "account" = authcid);
                CommandOutcome::respond(535, "Authentication failed")
            }
            Err(_) => CommandOutcome::respond(451, "Temporary authentication failure"),
        }
    }

    async fn handle_mail_from(&mut self, address: String, params: Vec<String>) -> CommandOutcome {
        if !matches!(self.state, State::Helloed) {
            return CommandOutcome::respond(503, "Bad sequence of commands");
        }
        let Some(session_address) = SessionAddress::parse(&address) else {
            return CommandOutcome::respond(553, "Mailbox name not allowed");
        };

        if let Some(size) = parsed_size_param(&params) {
            if size > self.instance.max_message_size {
                return CommandOutcome::respond(552, "Message size exceeds fixed maximum message size");
            }
        }

        if !session_address.is_null() {
            let local = self.directory.is_local_domain(&session_address.domain).await;
            if matches!(local, Ok(lookup) if lookup.is_local()) && self.params.auth_require_for_local_sender && self.data.authenticated_as.is_none() {
                trc::event!(INFO, trc::EventType::MailFromRejected, "sender" = session_address.address);
                return CommandOutcome::respond(530, "Authentication required");
            }
        }

        trc::event!(INFO, trc::EventType::MailFromAccepted, "sender" = session_address.address);
        self.data.mail_from = Some(session_address);
        self.state = State::MailReceived;
        CommandOutcome::respond(250, "OK")
    }

    async fn handle_rcpt_to(&mut self, address: String, _params: Vec<String>) -> CommandOutcome {
        if !matches!(self.state, State::MailReceived | State::RcptReceived) {
            return CommandOutcome::respond(503, "Bad sequence of commands");
        }
        if self.data.rcpt_to.len() >= self.params.rcpt_max {
            return CommandOutcome::respond(452, "Too many recipients");
        }
        let Some(session_address) = SessionAddress::parse(&address) else {
            return CommandOutcome::respond(553, "Mailbox name not allowed");
        };
        if session_address.is_null() {
            return CommandOutcome::respond(553, "Mailbox name not allowed");
        }

        let local = matches!(self.directory.is_local_domain(&session_address.domain).await, Ok(lookup) if lookup.is_local());
        if !local {
            let owns_sender = self
                .data
                .mail_from
                .as_ref()
                .and_then(|m| self.data.authenticated_as.as_deref().map(|a| (a, m)))
                .map(|(auth, mail_from)| auth.eq_ignore_ascii_case(&mail_from.address))
                .unwrap_or(false);

            if !owns_sender && !self.data.su_granted {
                trc::event!(INFO, trc::EventType::RcptToRejected, "rcpt" = session_address.address);
                let code = if self.data.authenticated_as.is_none() { 551 } else { 554 };
                return CommandOutcome::respond(code, "Relaying denied");
            }
        }

        trc::event!(INFO, trc::EventType::RcptToAccepted, "rcpt" = session_address.address);
        self.data.rcpt_to.push(session_address);
        self.state = State::RcptReceived;
        CommandOutcome::respond(250, "OK")
    }

    fn handle_data_command(&mut self) -> CommandOutcome {
        if !matches!(self.state, State::RcptReceived) {
            return CommandOutcome::respond(503, "Bad sequence of commands");
        }
        self.state = State::DataStreaming;
        CommandOutcome::EnterData
    }

    async fn handle_su(&mut self) -> CommandOutcome {
        let mut evaluator = spf::Evaluator::new(&self.resolver);
        let result = evaluator.evaluate(&self.server_domain, self.data.remote_ip).await;
        if matches!(result, spf::SpfResult::Pass) {
            self.data.su_granted = true;
            trc::event!(INFO, trc::EventType::SuGranted, "remote_ip" = self.data.remote_ip);
            CommandOutcome::respond(250, "SU granted")
        } else {
            trc::event!(INFO, trc::EventType::SuDenied, "remote_ip" = self.data.remote_ip);
            CommandOutcome::respond(550, "SU denied")
        }
    }

    /// Reads the DATA stream, enforcing the size cap incrementally, then
    /// runs authentication and hands the message off to the workers.
    /// Returns the final status line to write.
    async fn receive_data(&mut self) -> (u16, String) {
        trc::event!(DEBUG, trc::EventType::DataStart, "remote_ip" = self.data.remote_ip);
        let started = Instant::now();

        let stuffed = match self.conn.read_to_delim(b"\r\n.\r\n", self.instance.max_message_size).await {
            Ok(bytes) => bytes,
            Err(utils::net::Error::LimitExceeded) => {
                trc::event!(WARN, trc::EventType::DataTooLarge, "remote_ip" = self.data.remote_ip);
                let _ = self.conn.discard_to_delim(b"\r\n.\r\n").await;
                self.data.reset_envelope();
                self.state = State::Helloed;
                return (552, "Message size exceeds fixed maximum message size".to_string());
            }
            Err(_) => {
                self.state = State::Quit;
                return (451, "Requested action aborted: connection lost".to_string());
            }
        };

        let raw_message = unstuff_dots(&stuffed);
        self.data.messages_sent += 1;
        self.state = State::Helloed;
        self.data.reset_envelope();

        let (code, message_id) = self.complete_message(raw_message).await;
        let elapsed = started.elapsed().as_secs_f64().max(0.000_001);
        if code == 250 {
            let bytes = 0usize; // size already reflected in queued-for-delivery accounting by the workers
            let _ = bytes;
            (250, format!("{message_id} queued for delivery in {elapsed:.2} seconds"))
        } else {
            (code, message_id)
        }
    }

    async fn complete_message(&mut self, raw_message: Vec<u8>, ) -> (u16, String) {
        trc::event!(DEBUG, trc::EventType::DataComplete, "remote_ip" = self.data.remote_ip);

        let mime = match MimeMessage::parse(&raw_message) {
            Ok(m) => m,
            Err(_) => return (550, "Malformed message headers".to_string()),
        };

        let mail_from = self.data.mail_from.clone().unwrap_or(SessionAddress {
            address: String::new(),
            address_lcase: String::new(),
            domain: String::new(),
        });
        let spf_domain = if mail_from.is_null() { self.data.helo_domain.clone() } else { mail_from.domain.clone() };

        let spf_result = if self.mail_auth.spf.verify() {
            let mut evaluator = spf::Evaluator::new(&self.resolver);
            evaluator.evaluate(&spf_domain, self.data.remote_ip).await
        } else {
            spf::SpfResult::None
        };
        let spf_pass = matches!(spf_result, spf::SpfResult::Pass);
        trc::event!(DEBUG, trc::EventType::SpfEvaluated, "domain" = spf_domain);

        let dkim_result = if self.mail_auth.dkim.verify() {
            dkim::verify(&self.resolver, mime.headers(), body_bytes(&mime)).await
        } else {
            dkim::DkimResult::Neutral
        };
        trc::event!(DEBUG, trc::EventType::DkimVerified);

        let from_domain = mime
            .header("from")
            .and_then(|v| EmailAddress::parse_list(v).ok())
            .and_then(|list| list.into_iter().next())
            .map(|a| a.domain.to_ascii_lowercase())
            .unwrap_or_else(|| spf_domain.clone());

        let dkim_pass_domains = if matches!(dkim_result, dkim::DkimResult::Pass) {
            dkim_signature_domains(mime.headers())
        } else {
            Vec::new()
        };

        let dmarc_evaluation = if self.mail_auth.dmarc.verify() {
            Some(dmarc::evaluate(&self.resolver, &from_domain, spf_pass, &spf_domain, &dkim_pass_domains).await)
        } else {
            None
        };
        trc::event!(DEBUG, trc::EventType::DmarcEvaluated, "from_domain" = from_domain);

        if let Some(eval) = &dmarc_evaluation {
            if matches!(eval.result, dmarc::DmarcResult::Fail) && matches!(eval.policy, Some(dmarc::Policy::Reject)) {
                trc::event!(WARN, trc::EventType::RcptToRejected, "reason" = "dmarc_reject");
                return (550, "Message rejected due to DMARC policy".to_string());
            }
        }

        let auth_results = AuthResultsSummary {
            spf: spf_result_str(spf_result).to_string(),
            dkim: dkim_result_str(dkim_result).to_string(),
            dmarc: dmarc_evaluation.as_ref().map(|e| dmarc_result_str(e.result)).unwrap_or("none").to_string(),
            su: if self.data.su_granted { Some("pass".to_string()) } else { None },
            auth: self.data.authenticated_as.clone(),
        };

        let reverse_dns = self
            .resolver
            .reverse_lookup(self.data.remote_ip)
            .await
            .ok()
            .and_then(|names| names.into_iter().next())
            .unwrap_or_else(|| "unknown".to_string());

        let message_id = format!("{:x}-{:x}", self.session_id, self.data.messages_sent);

        let flags = mime
            .header("x-fannst-flags")
            .map(FannstFlags::parse)
            .unwrap_or_default();

        let (local_targets, remote_targets) = self.classify_targets(&mail_from, flags).await;

        let mut annotated = Vec::with_capacity(raw_message.len() + 256);
        annotated.extend_from_slice(self.received_header(&reverse_dns, &message_id).as_bytes());
        annotated.extend_from_slice(format!("X-Fannst-Authentication-Results: {}\r\n", auth_results.render()).as_bytes());

        // Outbound mail from an authenticated local sender gets a fresh
        // DKIM signature before it leaves for a remote target; mail that
        // only stays local has no need for one.
        if !remote_targets.is_empty() && self.data.authenticated_as.is_some() {
            if let Some(signer) = &self.dkim_signer {
                let signed_header_names: Vec<&str> = signer.signed_headers.iter().map(String::as_str).collect();
                if let Ok(signature) = dkim::sign(
                    &signer.signing_key,
                    &signer.domain,
                    &signer.selector,
                    &signed_header_names,
                    authentication::canon::Canonicalization::Relaxed,
                    authentication::canon::Canonicalization::Relaxed,
                    mime.headers(),
                    body_bytes(&mime),
                ) {
                    annotated.extend_from_slice(format!("DKIM-Signature: {}\r\n", signature.to_header_value()).as_bytes());
                    trc::event!(DEBUG, trc::EventType::DkimSigned, "domain" = signer.domain);
                }
            }
        }

        annotated.extend_from_slice(&raw_message);

        let handoff = SessionHandoff {
            message_id: message_id.clone(),
            raw_message: annotated,
            sender: mail_from.address.clone(),
            sender_domain: spf_domain.clone(),
            local_targets,
            remote_targets,
            authenticated_as: self.data.authenticated_as.clone(),
            flags,
            remote_ip: self.data.remote_ip,
            listener_id: self.instance.listener_id,
            auth_results,
        };

        match self.handoff_tx.try_send(handoff) {
            Ok(()) => {
                trc::event!(INFO, trc::EventType::StorageAttempt, "message_id" = message_id);
                (250, message_id)
            }
            Err(_) => {
                trc::event!(WARN, trc::EventType::QueueBackpressure, "message_id" = message_id);
                (451, "Requested action aborted: local error in processing".to_string())
            }
        }
    }

    async fn classify_targets(&self, mail_from: &SessionAddress, flags: FannstFlags) -> (Vec<LocalTarget>, Vec<String>) {
        let mut local = Vec::new();
        let mut remote = Vec::new();

        for rcpt in &self.data.rcpt_to {
            match self.directory.is_local_domain(&rcpt.domain).await {
                Ok(lookup) if lookup.is_local() => {
                    if let Ok(Some(account)) = self.directory.lookup_account(&rcpt.domain, rcpt.address.split('@').next().unwrap_or_default()).await {
                        local.push(LocalTarget {
                            domain: rcpt.domain.clone(),
                            mailbox: "INBOX".to_string(),
                            owner_id: account.owner_id,
                            bucket: account.bucket,
                            sender_display: mail_from.address.clone(),
                        });
                    }
                }
                _ => remote.push(rcpt.address.clone()),
            }
        }

        if !flags.skip_sent_copy {
            if let Some(authenticated) = &self.data.authenticated_as {
                if let Some((username, domain)) = authenticated.split_once('@') {
                    if let Ok(Some(account)) = self.directory.lookup_account(domain, username).await {
                        local.push(LocalTarget {
                            domain: domain.to_string(),
                            mailbox: "Sent".to_string(),
                            owner_id: account.owner_id,
                            bucket: account.bucket,
                            sender_display: mail_from.address.clone(),
                        });
                    }
                }
            }
        }

        (local, remote)
    }

    fn received_header(&self, reverse_dns: &str, message_id: &str) -> String {
        format!(
            "Received: from {} ({} [{}])\r\n\tby {}:{} (Fannst Mail Server) with ESMTP id {};\r\n\t{}\r\n",
            self.data.helo_domain,
            reverse_dns,
            self.data.remote_ip,
            self.instance.hostname,
            self.instance.listener_id,
            message_id,
            chrono::Utc::now().to_rfc2822(),
        )
    }
}

fn parsed_size_param(params: &[String]) -> Option<usize> {
    params.iter().find_map(|p| p.strip_prefix("SIZE=").and_then(|v| v.parse().ok()))
}

/// Removes one leading `.` from any DATA line that started with `..`,
/// undoing the sender's dot-stuffing. Operates on the already-unterminated
/// body (the `\r\n.\r\n` terminator itself was stripped by the reader).
pub(crate) fn unstuff_dots(stuffed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut at_line_start = true;
    let mut i = 0;
    while i < stuffed.len() {
        if at_line_start && stuffed[i] == b'.' && stuffed.get(i + 1) == Some(&b'.') {
            i += 1;
        }
        at_line_start = stuffed[i] == b'\n';
        out.push(stuffed[i]);
        i += 1;
    }
    out
}

fn body_bytes(mime: &MimeMessage) -> &[u8] {
    match mime {
        MimeMessage::Leaf { body, .. } => body,
        MimeMessage::Multipart { .. } => &[],
    }
}

fn dkim_signature_domains(headers: &[Header]) -> Vec<String> {
    headers
        .iter()
        .filter(|h| h.name == "dkim-signature")
        .filter_map(|h| {
            h.value.split(';').find_map(|tag| {
                let tag = tag.trim();
                tag.strip_prefix("d=").map(|d| d.trim().to_ascii_lowercase())
            })
        })
        .collect()
}

fn spf_result_str(result: spf::SpfResult) -> &'static str {
    match result {
        spf::SpfResult::Pass => "pass",
        spf::SpfResult::Fail => "fail",
        spf::SpfResult::SoftFail => "softfail",
        spf::SpfResult::Neutral => "neutral",
        spf::SpfResult::None => "none",
        spf::SpfResult::TempError => "temperror",
        spf::SpfResult::PermError => "permerror",
    }
}

fn dkim_result_str(result: dkim::DkimResult) -> &'static str {
    match result {
        dkim::DkimResult::Pass => "pass",
        dkim::DkimResult::Fail => "fail",
        dkim::DkimResult::Neutral => "neutral",
        dkim::DkimResult::SystemError => "temperror",
    }
}

fn dmarc_result_str(result: dmarc::DmarcResult) -> &'static str {
    match result {
        dmarc::DmarcResult::Pass => "pass",
        dmarc::DmarcResult::Fail => "fail",
        dmarc::DmarcResult::TempError => "temperror",
        dmarc::DmarcResult::PermError => "permerror",
        dmarc::DmarcResult::None => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use directory::InMemoryDirectory;
    use dns::Resolver;
    use tokio::io::duplex;
    use utils::listener::{ConcurrencyLimiter, ServerProtocol};

    fn test_instance() -> Arc<ServerInstance> {
        Arc::new(ServerInstance {
            id: "smtp".to_string(),
            listener_id: 25,
            protocol: ServerProtocol::SmtpStartTls,
            hostname: "mail.example.com".to_string(),
            max_message_size: 1024,
            tls_acceptor: None,
            limiter: ConcurrencyLimiter::new(0),
        })
    }

    fn test_session(directory: Arc<dyn Directory>) -> (Session, mpsc::Receiver<SessionHandoff>) {
        let (_client, server) = duplex(4096);
        let conn = Conn::plain(server, Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(8);
        let session = Session::new(
            test_instance(),
            conn,
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            SessionParameters { auth_require_for_local_sender: true, rcpt_max: 100 },
            directory,
            Arc::new(Resolver::new_cloudflare()),
            MailAuthConfig { spf: VerifyStrategy::Disable, dkim: VerifyStrategy::Disable, dmarc: VerifyStrategy::Disable },
            None,
            tx,
            "example.com".to_string(),
            "delivery@example.com".to_string(),
        );
        (session, rx)
    }

    #[tokio::test]
    async fn ehlo_moves_to_helloed_and_lists_capabilities() {
        let (mut session, _rx) = test_session(Arc::new(InMemoryDirectory::new()));
        let outcome = session.handle_command("EHLO client.example").await;
        assert!(matches!(session.state, State::Helloed));
        match outcome {
            CommandOutcome::Respond { code, lines } => {
                assert_eq!(code, 250);
                assert!(lines.iter().any(|l| l == "STARTTLS"));
            }
            _ => panic!("expected multi-line EHLO response"),
        }
    }

    #[tokio::test]
    async fn data_before_rcpt_is_bad_sequence() {
        let (mut session, _rx) = test_session(Arc::new(InMemoryDirectory::new()));
        session.handle_command("EHLO client.example").await;
        session.handle_command("MAIL FROM:<alice@example.com>").await;
        let outcome = session.handle_command("DATA").await;
        match outcome {
            CommandOutcome::Respond { code, .. } => assert_eq!(code, 503),
            _ => panic!("expected 503"),
        }
    }

    #[tokio::test]
    async fn unauthenticated_local_sender_is_refused() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_local_domain("example.com");
        let (mut session, _rx) = test_session(directory);
        session.handle_command("EHLO client.example").await;
        let outcome = session.handle_command("MAIL FROM:<alice@example.com>").await;
        match outcome {
            CommandOutcome::Respond { code, .. } => assert_eq!(code, 530),
            _ => panic!("expected 530"),
        }
    }

    #[tokio::test]
    async fn unauthenticated_relay_to_remote_domain_is_refused() {
        let (mut session, _rx) = test_session(Arc::new(InMemoryDirectory::new()));
        session.handle_command("EHLO client.example").await;
        session.handle_command("MAIL FROM:<alice@outside.example>").await;
        let outcome = session.handle_command("RCPT TO:<bob@remote.example>").await;
        match outcome {
            CommandOutcome::Respond { code, .. } => assert_eq!(code, 551),
            _ => panic!("expected 551"),
        }
    }

    #[tokio::test]
    async fn rcpt_to_local_recipient_is_accepted_without_authentication() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_local_domain("example.com");
        directory.add_account("example.com", "bob", "hunter2", "bob-owner".into(), 1);
        let (mut session, _rx) = test_session(directory);
        session.handle_command("EHLO client.example").await;
        session.handle_command("MAIL FROM:<alice@outside.example>").await;
        let outcome = session.handle_command("RCPT TO:<bob@example.com>").await;
        match outcome {
            CommandOutcome::Respond { code, .. } => assert_eq!(code, 250),
            _ => panic!("expected 250"),
        }
        assert!(matches!(session.state, State::RcptReceived));
    }

    #[tokio::test]
    async fn rset_clears_envelope_but_keeps_helo() {
        let (mut session, _rx) = test_session(Arc::new(InMemoryDirectory::new()));
        session.handle_command("EHLO client.example").await;
        session.handle_command("MAIL FROM:<alice@outside.example>").await;
        session.handle_command("RSET").await;
        assert!(session.data.mail_from.is_none());
        assert!(matches!(session.state, State::Helloed));
        assert_eq!(session.data.helo_domain, "client.example");
    }

    #[test]
    fn unstuff_dots_removes_one_leading_dot_per_line() {
        let stuffed = b"..leading dot\r\nplain line\r\n...three dots\r\n";
        let result = unstuff_dots(stuffed);
        assert_eq!(result, b".leading dot\r\nplain line\r\n..three dots\r\n".to_vec());
    }

}
