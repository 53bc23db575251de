/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Process entry point: loads configuration, wires the in-memory directory
//! and store reference backends to the session driver, and runs one accept
//! loop per configured listener plus the shared background worker task.

use std::sync::Arc;

use directory::InMemoryDirectory;
use dns::Resolver;
use store::InMemoryStore;
use tokio::net::TcpListener;
use utils::listener::{ConcurrencyLimiter, ServerInstance, ServerProtocol};

use common::config::{Configuration, ListenerConfig};
use smtp::session::{Session, SessionParameters};
use smtp::{SessionHandoff, WorkerContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    trc::init_subscriber();

    let config = Configuration::from_env()?;
    tracing::info!(node = %config.node_name, domain = %config.server_domain, "starting fannst-mail-server");

    let directory: Arc<dyn directory::Directory> = Arc::new(InMemoryDirectory::new());
    directory.add_local_domain(&config.server_domain);

    let store: Arc<dyn store::MailStore> = Arc::new(InMemoryStore::new());
    let resolver = Arc::new(Resolver::new_cloudflare());

    let tls_acceptor = match &config.tls {
        Some(tls) => Some(utils::listener::load_tls_acceptor(&tls.cert_path, &tls.key_path)?),
        None => None,
    };
    let tls_connector = config.tls.as_ref().map(|_| smtp::client::client_tls_connector());

    let (handoff_tx, handoff_rx) = tokio::sync::mpsc::channel::<SessionHandoff>(config.queue.worker_queue_high_water_mark);

    let worker_ctx = WorkerContext {
        store,
        resolver: resolver.clone(),
        server_domain: config.server_domain.clone(),
        bounce_sender: config.queue.bounce_sender.clone(),
        tls_connector,
        queue_high_water_mark: config.queue.worker_queue_high_water_mark,
        drain_interval: config.queue.worker_drain_interval,
    };
    tokio::spawn(smtp::workers::run(worker_ctx, handoff_rx));

    let mut accept_loops = Vec::new();
    for listener in &config.listeners {
        let instance = Arc::new(build_server_instance(listener, &config, tls_acceptor.clone())?);
        let tcp = TcpListener::bind(&listener.bind).await?;
        tracing::info!(listener = %listener.id, bind = %listener.bind, "listening");

        accept_loops.push(tokio::spawn(accept_loop(
            tcp,
            instance,
            directory.clone(),
            resolver.clone(),
            config.mail_auth,
            config.dkim_signer.clone(),
            handoff_tx.clone(),
            config.server_domain.clone(),
            config.queue.bounce_sender.clone(),
            config.session.auth_require_for_local_sender,
            config.session.rcpt_max,
        )));
    }

    for accept_loop in accept_loops {
        let _ = accept_loop.await;
    }

    Ok(())
}

fn build_server_instance(
    listener: &ListenerConfig,
    config: &Configuration,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
) -> Result<ServerInstance, Box<dyn std::error::Error>> {
    let listener_id: u16 = listener
        .bind
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .unwrap_or(0);

    let protocol = if listener.implicit_tls {
        ServerProtocol::SmtpImplicitTls
    } else {
        ServerProtocol::SmtpStartTls
    };

    Ok(ServerInstance {
        id: listener.id.clone(),
        listener_id,
        protocol,
        hostname: config.session.greeting_domain.clone(),
        max_message_size: config.session.max_message_size,
        tls_acceptor,
        limiter: ConcurrencyLimiter::new(0),
    })
}

/// Accepts connections on one listener forever, spawning one task per
/// connection. A connection whose session panics or errors is simply
/// dropped; it never brings down the listener.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    tcp: TcpListener,
    instance: Arc<ServerInstance>,
    directory: Arc<dyn directory::Directory>,
    resolver: Arc<Resolver>,
    mail_auth: common::MailAuthConfig,
    dkim_signer: Option<Arc<common::DkimSigner>>,
    handoff_tx: tokio::sync::mpsc::Sender<SessionHandoff>,
    server_domain: String,
    bounce_sender: String,
    auth_require_for_local_sender: bool,
    rcpt_max: usize,
) {
    loop {
        let (stream, remote_addr) = match tcp.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let Some(guard) = instance.limiter.try_acquire() else {
            continue;
        };

        let instance = instance.clone();
        let directory = directory.clone();
        let resolver = resolver.clone();
        let dkim_signer = dkim_signer.clone();
        let handoff_tx = handoff_tx.clone();
        let server_domain = server_domain.clone();
        let bounce_sender = bounce_sender.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let mut conn = utils::Conn::plain(stream, std::time::Duration::from_secs(300));
            if instance.is_implicit_tls() {
                let Some(acceptor) = &instance.tls_acceptor else {
                    return;
                };
                if conn.upgrade_server(acceptor).await.is_err() {
                    return;
                }
            }

            let params = SessionParameters { auth_require_for_local_sender, rcpt_max };

            let mut session = Session::new(
                instance,
                conn,
                remote_addr.ip(),
                params,
                directory,
                resolver,
                mail_auth,
                dkim_signer,
                handoff_tx,
                server_domain,
                bounce_sender,
            );
            session.run().await;
        });
    }
}
