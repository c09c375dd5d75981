use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use speech_player::{PlaybackStatus, SpeechPlayer, SpeechRequest, TtsConfig, TtsModel, Voice};

#[derive(Parser)]
#[command(name = "speech-player", version, about = "Speak text through the OpenAI speech API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream raw PCM and play it while it downloads
    Stream {
        text: String,
        #[command(flatten)]
        voicing: Voicing,
    },
    /// Download the whole MP3, then play it
    Speak {
        text: String,
        /// Also write the MP3 to this file
        #[arg(long)]
        save: Option<PathBuf>,
        #[command(flatten)]
        voicing: Voicing,
    },
}

#[derive(Args)]
struct Voicing {
    #[arg(long, default_value = "alloy")]
    voice: String,
    #[arg(long, default_value = "tts-1")]
    model: String,
    /// Delivery hints (gpt-4o-mini-tts only)
    #[arg(long)]
    instructions: Option<String>,
    #[arg(long)]
    speed: Option<f32>,
}

impl Voicing {
    fn request(&self, text: String) -> SpeechRequest {
        let model = TtsModel::from_str_or_default(&self.model);
        let mut request = SpeechRequest::new(text)
            .voice(Voice::from_str_or_default(&self.voice))
            .model(model);
        if let Some(instructions) = self.instructions.as_ref() {
            if !model.supports_instructions() {
                log::warn!("{} ignores --instructions", model);
            }
            request = request.instructions(instructions.clone());
        }
        if let Some(speed) = self.speed {
            request = request.speed(speed);
        }
        request
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = TtsConfig::from_env().context("loading configuration")?;

    let player = SpeechPlayer::new(config)?;

    let stopper = player.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping playback");
            let _ = stopper.stop_player().await;
        }
    });

    let result = match cli.command {
        Command::Stream { text, voicing } => stream(&player, voicing.request(text)).await,
        Command::Speak {
            text,
            save,
            voicing,
        } => speak(&player, voicing.request(text), save).await,
    };

    player.dispose().await?;
    result
}

async fn stream(player: &SpeechPlayer, request: SpeechRequest) -> anyhow::Result<()> {
    let mut status = player.status_stream();
    player.stream_speak(request, None).await?;

    while let Ok(next) = status.recv().await {
        log::debug!("status: {:?}", next);
        if matches!(next, PlaybackStatus::Completed | PlaybackStatus::Stopped) {
            break;
        }
    }
    Ok(())
}

async fn speak(
    player: &SpeechPlayer,
    request: SpeechRequest,
    save: Option<PathBuf>,
) -> anyhow::Result<()> {
    let audio = player.create_speak(request, None).await?;

    if let Some(path) = save {
        std::fs::write(&path, &audio).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Saved {} bytes to {}", audio.len(), path.display());
    }

    while player.is_playing() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
