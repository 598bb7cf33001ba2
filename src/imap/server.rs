//-
// Copyright (c) 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

//! The listener and per-connection session loop.
//!
//! Startup order matters and is contractual: indexes are ensured, the
//! message handler and notifier are constructed, the login throttle is
//! built, and only then does the listener bind; a bind failure is
//! reported synchronously to the caller, while per-connection errors go
//! to the log.

use std::pin::Pin;
use std::sync::Arc;

use log::{error, info};
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

use super::dispatcher::{AfterCommand, CommandProcessor};
use super::request_reader::{RawCommand, ReadOutcome, RequestReader};
use super::response_writer::ResponseWriter;
use super::syntax::{self as s, Command};
use super::BoxStream;
use crate::account::auth::Authenticator;
use crate::account::messages::MessageHandler;
use crate::account::notify::Notifier;
use crate::storage::{SessionId, Storage};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::rate_limit::LoginThrottle;
use crate::support::system_config::SystemConfig;

pub async fn serve(config: SystemConfig) -> Result<(), Error> {
    let config = Arc::new(config);

    let storage = Arc::new(Storage::connect(&config.database).await?);
    storage.ensure_indexes().await?;

    let notifier = Arc::new(Notifier::new(Arc::clone(&storage)));
    let handler = Arc::new(MessageHandler::new(
        Arc::clone(&storage),
        Arc::clone(&notifier),
        config.limits.max_storage,
        config.limits.max_message,
    ));
    let authenticator = Arc::new(Authenticator::new(
        Arc::clone(&storage),
        LoginThrottle::new(&config.login_throttle),
    ));

    let tls = Arc::new(build_tls_acceptor(&config)?);

    let listener = TcpListener::bind((
        config.listener.host.as_str(),
        config.listener.port,
    ))
    .await?;
    info!(
        "listening on {}:{} (secure={})",
        config.listener.host, config.listener.port,
        config.listener.secure,
    );

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };

        let config = Arc::clone(&config);
        let storage = Arc::clone(&storage);
        let notifier = Arc::clone(&notifier);
        let handler = Arc::clone(&handler);
        let authenticator = Arc::clone(&authenticator);
        let tls = Arc::clone(&tls);

        tokio::spawn(async move {
            let session_id = SessionId(rand::random());
            let log_prefix = LogPrefix::new(peer, session_id.0);
            let processor = CommandProcessor::new(
                log_prefix.clone(),
                Arc::clone(&config),
                storage,
                notifier,
                handler,
                authenticator,
                session_id,
                peer.ip(),
                config.listener.secure,
            );

            if let Err(e) =
                handle_connection(config, tls, socket, processor).await
            {
                info!("{} Connection closed: {}", log_prefix, e);
            } else {
                info!("{} Connection closed", log_prefix);
            }
        });
    }
}

fn build_tls_acceptor(
    config: &SystemConfig,
) -> Result<SslAcceptor, Error> {
    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_private_key_file(
        &config.listener.private_key,
        SslFiletype::PEM,
    )?;
    builder.set_certificate_chain_file(
        &config.listener.certificate_chain,
    )?;
    Ok(builder.build())
}

enum SessionEnd {
    Done,
    UpgradeTls,
}

async fn handle_connection(
    config: Arc<SystemConfig>,
    tls: Arc<SslAcceptor>,
    socket: TcpStream,
    mut processor: CommandProcessor,
) -> Result<(), Error> {
    let _ = socket.set_nodelay(true);

    let mut stream: BoxStream = if config.listener.secure {
        Box::new(accept_tls(&tls, socket).await?)
    } else {
        Box::new(socket)
    };

    let mut greeted = false;
    loop {
        let (read, write) = tokio::io::split(stream);
        let mut reader =
            RequestReader::new(read, config.limits.max_message);
        let mut writer = ResponseWriter::new(write);

        if !greeted {
            processor.greet(&mut writer).await?;
            greeted = true;
        }

        match session_loop(&mut processor, &mut reader, &mut writer)
            .await?
        {
            SessionEnd::Done => return Ok(()),
            SessionEnd::UpgradeTls => {
                // The tagged OK has been flushed; the client is now
                // starting a handshake on the raw stream.
                let plain =
                    reader.into_inner().unsplit(writer.into_inner());
                let ssl = Ssl::new(tls.context())?;
                let mut tls_stream = SslStream::new(ssl, plain)?;
                Pin::new(&mut tls_stream).accept().await.map_err(
                    |e| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e,
                        ))
                    },
                )?;
                stream = Box::new(tls_stream);
            }
        }
    }
}

async fn accept_tls(
    tls: &SslAcceptor,
    socket: TcpStream,
) -> Result<SslStream<TcpStream>, Error> {
    let ssl = Ssl::new(tls.context())?;
    let mut stream = SslStream::new(ssl, socket)?;
    Pin::new(&mut stream).accept().await.map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e,
        ))
    })?;
    Ok(stream)
}

async fn session_loop(
    processor: &mut CommandProcessor,
    reader: &mut RequestReader,
    writer: &mut ResponseWriter,
) -> Result<SessionEnd, Error> {
    while !processor.logged_out() {
        let raw = match reader.read_command(writer).await? {
            ReadOutcome::Eof => return Ok(SessionEnd::Done),
            ReadOutcome::TooLong => {
                // There is no reliable way to resynchronise after
                // refusing part of a command.
                writer
                    .write_line("* BYE Command line too long")
                    .await?;
                return Ok(SessionEnd::Done);
            }
            ReadOutcome::Command(raw) => raw,
        };

        match parse_raw(raw) {
            Err((tag, e)) => {
                processor
                    .handle_bad_command(tag, &e.message, writer)
                    .await?;
            }
            Ok(cmdline)
                if matches!(cmdline.cmd, Command::Idle) =>
            {
                handle_idle(processor, reader, writer, cmdline.tag)
                    .await?;
            }
            Ok(cmdline) => {
                match processor
                    .handle_command(cmdline, writer)
                    .await?
                {
                    AfterCommand::Continue => {}
                    AfterCommand::Close
                    | AfterCommand::Destroy => {
                        return Ok(SessionEnd::Done)
                    }
                    AfterCommand::StartTls => {
                        return Ok(SessionEnd::UpgradeTls)
                    }
                }
            }
        }
    }

    Ok(SessionEnd::Done)
}

fn parse_raw(
    raw: RawCommand,
) -> Result<s::CommandLine, (Option<String>, s::ParseError)> {
    s::parse_command(&raw.line, raw.literals)
}

/// IDLE: drain notifications as they arrive until the client says DONE.
async fn handle_idle(
    processor: &mut CommandProcessor,
    reader: &mut RequestReader,
    writer: &mut ResponseWriter,
    tag: String,
) -> Result<(), Error> {
    writer.write_continuation("idling").await?;

    // The read future lives across wake-ups so a DONE arriving byte by
    // byte survives the select loop.
    let done = reader.read_bare_line();
    tokio::pin!(done);

    loop {
        tokio::select! {
            line = &mut done => {
                // Whatever the line says, the idle is over; anything
                // but DONE is a protocol violation we answer by ending
                // it anyway.
                let _ = line?;
                break;
            }
            _ = processor.await_wake() => {
                if let Err(e) =
                    processor.drain_notifications(true, writer).await
                {
                    match e {
                        Error::Io(e) => return Err(Error::Io(e)),
                        e => error!(
                            "{} IDLE drain failed: {}",
                            processor.log_prefix(), e,
                        ),
                    }
                }
            }
        }
    }

    // Catch anything that arrived between the last wake and DONE.
    if let Err(e) = processor.drain_notifications(true, writer).await {
        match e {
            Error::Io(e) => return Err(Error::Io(e)),
            e => error!(
                "{} IDLE drain failed: {}",
                processor.log_prefix(), e,
            ),
        }
    }
    writer.write_line(&format!("{} OK IDLE terminated", tag)).await?;
    Ok(())
}
