use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use futures::{AsyncReadExt, AsyncWriteExt};
use rendezvous::{
    activation::{Activation, CommandHandler, Host, DIAGNOSTIC_COMMAND},
    config::BootstrapConfig,
    launch::{callback::CallbackLauncher, LaunchError, LaunchReport, LauncherRegistry},
};
use tracing_subscriber::EnvFilter;

/// Host printing notifications on the terminal.
struct TerminalHost;

impl Host for TerminalHost {
    fn register_command(&self, name: &str, _handler: CommandHandler) {
        println!("registered command {name}");
    }

    fn show_information_message(&self, message: &str) {
        println!("info: {message}");
    }

    fn show_error_message(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

/// Plays the server: dials back and echoes every chunk it receives.
fn echo_server(address: String) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(address)?;
    let mut buf = [0u8; 1024];
    loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..read])?;
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let config = BootstrapConfig::from_toml_str(
        r#"
base_port = 8000
connect_timeout_ms = 5000
server_kind = "R"
"#,
    )?;

    let mut registry = LauncherRegistry::new();
    registry.register(
        config.launcher_capability.clone(),
        CallbackLauncher::new(|kind: &str, address: &str| {
            if kind != "R" {
                return LaunchReport::failed(LaunchError::new(format!("unknown kind {kind}")));
            }
            let address = address.to_owned();
            let (sender, receiver) = futures::channel::oneshot::channel();
            std::thread::spawn(move || {
                // Give the client time to start waiting, as a real process would.
                std::thread::sleep(Duration::from_millis(100));
                let outcome = echo_server(address).map_err(LaunchError::from);
                let _ = sender.send(outcome);
            });
            LaunchReport::new(async move {
                receiver
                    .await
                    .unwrap_or_else(|_| Err(LaunchError::new("server thread vanished")))
            })
        }),
    );

    let activation = Activation::start_with_config(Arc::new(TerminalHost), &registry, &config)?;
    println!("try the {DIAGNOSTIC_COMMAND} command from the host");

    let server_options = activation.server_options();

    futures::executor::block_on(async {
        let mut transport = server_options().await?;

        transport.writer.write_all(b"hello!").await?;
        transport.writer.flush().await?;

        let mut reply = [0u8; 6];
        transport.reader.read_exact(&mut reply).await?;
        println!("{}", String::from_utf8_lossy(&reply));

        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    activation.stop();

    Ok(())
}
