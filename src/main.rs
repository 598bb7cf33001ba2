//-
// Copyright (c) 2023, 2024, the Wingmap authors
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

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

mod account;
mod imap;
mod mime;
mod storage;
mod support;

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(name = "wingmap", about = "IMAP server over a document database")]
enum Command {
    /// Run the IMAP listener.
    Serve {
        /// Path to wingmap.toml.
        #[structopt(long, parse(from_os_str))]
        config: PathBuf,
    },
}

fn main() {
    init_simple_log();

    match Command::from_args() {
        Command::Serve { config } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("wingmap: unable to load {:?}: {}", config, e);
                    process::exit(1);
                }
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to start async runtime");

            if let Err(e) = runtime.block_on(imap::server::serve(config)) {
                eprintln!("wingmap: fatal: {}", e);
                process::exit(1);
            }
        }
    }
}

fn load_config(
    path: &std::path::Path,
) -> Result<SystemConfig, crate::support::error::Error> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn init_simple_log() {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )
        .unwrap();
    log4rs::init_config(log_config).unwrap();
}
