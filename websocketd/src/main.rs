#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser as _;
use tap::Pipe as _;
use websocketd::config::{Cli, Conf};
use websocketd::limiter::ForkLimiter;
use websocketd::listener::{GatewayListener, RedirectListener};
use websocketd::{GatewayState, log, tls};
use websocketd_task::{ChildTask, Shutdown, spawn_task};

const LICENSE: &str = r#"Copyright 2013 Joe Walnes and the websocketd team.
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice,
   this list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE
LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR
CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF
SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS
INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN
CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE)
ARISING IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
POSSIBILITY OF SUCH DAMAGE."#;

fn main() {
    let cli = Cli::parse();

    if cli.license {
        println!("{LICENSE}");
        std::process::exit(0);
    }

    match run(cli) {
        Ok(()) => {}
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let conf = Conf::from_cli(cli)?.pipe(Arc::new);

    log::init(conf.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"));

    if conf.ssl() {
        tls::install_default_crypto_provider();
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    let result = rt.block_on(async {
        tokio::select! {
            result = serve(Arc::clone(&conf)) => result,
            result = tokio::signal::ctrl_c() => result.context("ctrl-c event"),
        }
    });

    rt.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(()) => {
            info!("Terminated successfully");
            Ok(())
        }
        Err(error) => {
            error!("{error:#}");
            Err(error)
        }
    }
}

async fn serve(conf: Arc<Conf>) -> anyhow::Result<()> {
    let state = GatewayState {
        conf: Arc::clone(&conf),
        limiter: Arc::new(ForkLimiter::new(conf.max_forks)),
    };

    let tls_acceptor = conf
        .tls
        .as_ref()
        .map(|tls_conf| tls::build_acceptor(&tls_conf.cert_file, &tls_conf.key_file))
        .transpose()
        .context("TLS setup failed")?;

    let shutdown = Shutdown::new();
    let mut tasks: Vec<ChildTask<anyhow::Result<()>>> = Vec::new();

    for address in &conf.addresses {
        let listener = GatewayListener::init_and_bind(address, tls_acceptor.clone(), state.clone())
            .with_context(|| format!("failed to initialize listener on {address}"))?;
        tasks.push(spawn_task(listener, shutdown.subscribe()));
    }

    if let Some(port) = conf.redir_port {
        let redirect = RedirectListener::init_and_bind(port, conf.port)
            .context("failed to initialize the redirect listener")?;
        tasks.push(spawn_task(redirect, shutdown.subscribe()));
    }

    run_until_first_failure(tasks, shutdown).await
}

async fn run_until_first_failure(
    tasks: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let mut join_all = futures::future::select_all(tasks.into_iter().map(|task| Box::pin(task.join())));

    loop {
        let (result, _, rest) = join_all.await;

        match result {
            Ok(Ok(())) => trace!("A task terminated gracefully"),
            Ok(Err(error)) => {
                shutdown.signal();
                return Err(error);
            }
            Err(error) => {
                shutdown.signal();
                return Err(anyhow::anyhow!("a task failed unexpectedly: {error}"));
            }
        }

        if rest.is_empty() {
            return Ok(());
        }

        join_all = futures::future::select_all(rest);
    }
}
