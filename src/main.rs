use ai_studio::{
    app::{build_context, Studio},
    gallery::DownloadBlob,
    lora::MAX_ACTIVE_LORAS,
    model::{LoraUpdate, Scheduler},
    state::StudioEvent,
    GenerationOutcome,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use std::{fs, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Command-line client for the AI Studio image service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show service statistics and device status
    Status {
        /// Keep sampling device status this many times at the poll interval
        #[arg(long, value_name = "SAMPLES")]
        watch: Option<u32>,
    },
    /// List available models
    Models,
    /// Load a model on the service
    Load { key: String },
    /// Generate images and save them to disk
    Generate(GenerateArgs),
    /// Manage LoRA adapters
    Loras {
        #[command(subcommand)]
        action: Option<LoraAction>,
    },
    /// List, search, show or delete past generations
    History {
        #[arg(long, conflicts_with_all = ["id", "delete"])]
        search: Option<String>,
        /// Show one generation in full
        #[arg(long, conflicts_with = "delete")]
        id: Option<i64>,
        /// Delete one generation
        #[arg(long, value_name = "ID")]
        delete: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum LoraAction {
    List,
    Activate { id: i64 },
    Deactivate { id: i64 },
    /// Change the weight of an active adapter
    Weight {
        id: i64,
        #[arg(allow_hyphen_values = true)]
        weight: f32,
    },
    /// Edit an adapter's details
    Edit {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        trigger_words: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        weight: Option<f32>,
    },
    DeactivateAll,
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,

    #[arg(long, default_value = "")]
    negative: String,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    steps: Option<u32>,

    #[arg(long)]
    guidance: Option<f32>,

    #[arg(long)]
    count: Option<u32>,

    #[arg(long, allow_hyphen_values = true)]
    seed: Option<i64>,

    #[arg(long)]
    scheduler: Option<Scheduler>,

    /// Source image for image-to-image generation
    #[arg(long)]
    init_image: Option<PathBuf>,

    /// Denoise strength used with --init-image
    #[arg(long)]
    strength: Option<f32>,

    #[arg(long)]
    clip_skip: Option<u8>,

    #[arg(long)]
    no_nsfw_filter: bool,

    /// Output directory (defaults to the app data directory)
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let context = build_context()?;
    let studio = context.studio.clone();
    let output_dir = context.config.output_path();

    context.runtime.block_on(async move {
        studio.bootstrap().await;
        match args.command {
            Command::Status { watch } => status(&studio, watch).await,
            Command::Models => {
                let catalog = studio.catalog.snapshot();
                for model in catalog.models() {
                    let marker = if catalog.current_key() == Some(model.key.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {:<28} {:<10} {}", model.key, model.model_type, model.name);
                }
                Ok(())
            }
            Command::Load { key } => studio.load_model(&key).await.map_err(|err| anyhow!(err)),
            Command::Generate(gen) => generate(&studio, gen, output_dir).await,
            Command::Loras { action } => loras(&studio, action.unwrap_or(LoraAction::List)).await,
            Command::History { search, id, delete } => {
                if let Some(id) = delete {
                    studio
                        .delete_history_entry(id)
                        .await
                        .map_err(|err| anyhow!(err))?;
                    println!("Deleted generation {id}");
                    return Ok(());
                }
                if let Some(id) = id {
                    let entry = studio.history_entry(id).await.map_err(|err| anyhow!(err))?;
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                    return Ok(());
                }
                let page = match search {
                    Some(query) => studio.search_history(&query).await,
                    None => studio.history().await,
                }
                .map_err(|err| anyhow!(err))?;
                for entry in page.generations {
                    println!(
                        "{:>5}  {}  {}x{}  {}",
                        entry.id, entry.created_at, entry.width, entry.height, entry.prompt
                    );
                }
                Ok(())
            }
        }
    })
}

async fn status(studio: &Studio, watch: Option<u32>) -> Result<()> {
    let stats = studio.stats().await.map_err(|err| anyhow!(err))?;
    println!("Device: {}", stats.gpu.summary());
    println!(
        "Generations: {} across {} model(s), avg {:.1} steps, guidance {:.2}",
        stats.stats.total_generations,
        stats.stats.models_used,
        stats.stats.avg_steps,
        stats.stats.avg_guidance
    );

    let Some(samples) = watch else {
        return Ok(());
    };
    let Some(poller) = studio.start_device_polling() else {
        return Ok(());
    };
    let period = studio.settings().device_poll_interval();
    for _ in 0..samples {
        tokio::time::sleep(period).await;
        if let Some(summary) = studio.store.read(|state| state.device().map(|d| d.summary())) {
            println!("Device: {summary}");
        }
    }
    poller.stop().await;
    Ok(())
}

async fn generate(studio: &Studio, gen: GenerateArgs, output_dir: PathBuf) -> Result<()> {
    let defaults = &studio.settings().generation_defaults;
    let mut params = defaults.parameters(gen.prompt);
    params.negative_prompt = gen.negative;
    params.width = gen.width.unwrap_or(params.width);
    params.height = gen.height.unwrap_or(params.height);
    params.steps = gen.steps.unwrap_or(params.steps);
    params.guidance_scale = gen.guidance.unwrap_or(params.guidance_scale);
    params.image_count = gen.count.unwrap_or(params.image_count);
    params.seed = gen.seed;
    params.scheduler = gen.scheduler.unwrap_or(params.scheduler);
    params.clip_skip = gen.clip_skip.or(params.clip_skip);
    params.disable_nsfw_filter = gen.no_nsfw_filter;
    if let Some(path) = gen.init_image {
        let bytes = fs::read(&path).with_context(|| format!("failed to read {path:?}"))?;
        params = params.with_input_image(bytes, gen.strength);
    }

    let events = studio.store.subscribe();
    let outcome = studio.generator.generate(&params).await;
    for event in events.try_iter() {
        if let StudioEvent::NotificationShown(notification) = event {
            eprintln!("[{:?}] {}", notification.kind, notification.message);
        }
    }

    let dir = gen.out.unwrap_or(output_dir);
    let result = match outcome {
        Ok(GenerationOutcome::Completed { images, .. }) => {
            let blobs: Vec<DownloadBlob> = studio.store.read(|state| {
                state
                    .gallery()
                    .images()
                    .iter()
                    .take(images)
                    .map(DownloadBlob::from_image)
                    .collect()
            });
            for blob in blobs {
                let path = blob.save_to(&dir)?;
                info!("Saved {}", path.display());
                println!("{}", path.display());
            }
            Ok(())
        }
        Ok(GenerationOutcome::AlreadyRunning) => Err(anyhow!("a generation is already running")),
        Err(err) => Err(anyhow!(err)),
    };

    result
}

async fn loras(studio: &Studio, action: LoraAction) -> Result<()> {
    match action {
        LoraAction::List => {}
        LoraAction::Activate { id } => studio.loras.activate(id).await?,
        LoraAction::Deactivate { id } => studio.loras.deactivate(id).await?,
        LoraAction::Weight { id, weight } => {
            studio.loras.set_weight(id, weight)?;
            // Local until sent.
            studio.loras.activate(id).await?;
        }
        LoraAction::Edit {
            id,
            name,
            trigger_words,
            description,
            weight,
        } => {
            let update = LoraUpdate {
                name,
                trigger_words,
                description,
                weight,
            };
            studio.loras.update(id, update).await?;
        }
        LoraAction::DeactivateAll => studio.loras.deactivate_all().await?,
    }

    let mirror = studio.loras.snapshot();
    println!("{}/{} active", mirror.active_count(), MAX_ACTIVE_LORAS);
    for lora in mirror.listed() {
        println!(
            "{} {:>4}  {:<24} {:<8} weight {:.2}{}",
            if lora.is_active { "*" } else { " " },
            lora.id,
            lora.name,
            lora.model_type,
            lora.weight,
            lora.trigger_words
                .as_deref()
                .map(|words| format!("  [{words}]"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
