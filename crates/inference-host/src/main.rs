#[cfg(feature = "cli")]
mod cli {
    use clap::{Parser, Subcommand};
    use futures::StreamExt;
    use inference_host::model_runtime::{GenerationParams, LoadRequest, ModelFormat};
    use inference_host::{telemetry, Config, InferenceHost};
    use std::io::Write;
    use std::path::PathBuf;

    #[derive(Parser)]
    #[command(name = "inference-host", version, about = "Hardware-adaptive local model host")]
    pub struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Print the current hardware profile.
        Profile,
        /// Classify an artifact and show the load policy for this machine.
        Detect {
            path: PathBuf,
            #[arg(long)]
            format: Option<ModelFormat>,
        },
        /// Load a model and stream a completion to stdout.
        Generate {
            path: PathBuf,
            prompt: String,
            #[arg(long, default_value_t = 256)]
            max_tokens: u32,
            #[arg(long)]
            format: Option<ModelFormat>,
        },
        /// Load a model and print the embedding of `text` as JSON.
        Embed {
            path: PathBuf,
            text: String,
            #[arg(long)]
            format: Option<ModelFormat>,
        },
    }

    fn request(path: PathBuf, format: Option<ModelFormat>) -> LoadRequest {
        let request = LoadRequest::new(path);
        match format {
            Some(format) => request.with_format(format),
            None => request,
        }
    }

    pub async fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        telemetry::init_tracing();

        let cfg = Config::from_env()?;
        cfg.print_config();
        let host = InferenceHost::from_config(&cfg)?;

        match cli.command {
            Command::Profile => {
                println!("{}", serde_json::to_string_pretty(&*host.profile())?);
            }
            Command::Detect { path, format } => {
                let request = request(path, format);
                let descriptor = host.describe(&request)?;
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
                match host.plan(&request) {
                    Ok(policy) => println!("{}", serde_json::to_string_pretty(&policy)?),
                    Err(e) => println!("not loadable here: {} ({})", e, e.code()),
                }
            }
            Command::Generate {
                path,
                prompt,
                max_tokens,
                format,
            } => {
                let handle = host.request_load(request(path, format)).await?;
                let id = handle.id().clone();
                drop(handle);

                let params = GenerationParams {
                    max_tokens,
                    ..GenerationParams::default()
                };
                let mut stream = host.stream_generate(&id, &prompt, &params).await?;
                let mut stdout = std::io::stdout();
                while let Some(token) = stream.next().await {
                    write!(stdout, "{}", token?.text)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
            }
            Command::Embed { path, text, format } => {
                let handle = host.request_load(request(path, format)).await?;
                let id = handle.id().clone();
                drop(handle);
                let vector = host.embed(&id, &text).await?;
                println!("{}", serde_json::to_string(&vector)?);
            }
        }

        host.shutdown().await;
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
