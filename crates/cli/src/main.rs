mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand};
use llava_core::{
    loader,
    models::{
        self,
        llava_llama3::{MODEL_TYPE, VISION_TOWER_PREFIX},
        registry, CausalLm, GenerateOptions, HasBackbone, LlavaLlama3Config,
    },
    multimodal::{ImageProcessor, DEFAULT_IMAGE_TOKEN},
    sampling::SamplingParams,
    tokenizer::{tokenizer_image_token, ChatMessage, ChatTemplateEngine, TokenizerWrapper},
};
use tracing::info;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "llava-cli", about = "Image-conditioned generation with LLaVA-Llama3")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a prompt about zero or more images
    Generate {
        /// Checkpoint directory or Hub id
        #[arg(long)]
        model: Option<String>,

        /// Image files, one `<image>` placeholder each
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// User prompt; `<image>` markers are added in front when missing
        #[arg(long)]
        prompt: String,

        /// Vision tower checkpoint when the model ships without one
        #[arg(long)]
        vision_tower: Option<String>,

        #[arg(long)]
        system_prompt: Option<String>,

        #[arg(long)]
        max_new_tokens: Option<usize>,

        /// 0 selects greedy decoding
        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_p: Option<f32>,

        #[arg(long)]
        seed: Option<u64>,

        /// auto, bf16, fp16 or fp32
        #[arg(long)]
        dtype: Option<String>,

        /// cpu, cuda or metal
        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print the parsed configuration of a checkpoint
    Inspect {
        #[arg(long)]
        model: Option<String>,
    },
    /// List supported architectures
    Models,
}

fn main() -> anyhow::Result<()> {
    let file_config = CliConfig::load();
    let cli = Cli::parse();
    models::register_builtin_models(registry::global());

    match cli.command {
        Command::Generate {
            model,
            images,
            prompt,
            vision_tower,
            system_prompt,
            max_new_tokens,
            temperature,
            top_p,
            seed,
            dtype,
            device,
            log_level,
        } => {
            let mut cfg = file_config;
            cfg.merge(&CliConfig {
                model,
                vision_tower,
                dtype,
                device,
                max_new_tokens,
                temperature,
                top_p,
                seed,
                system_prompt,
                log_level,
            });
            logging::init(
                cfg.log_level.as_deref().unwrap_or("info"),
                logging::LogFormat::from_env(),
            )?;
            run_generate(&cfg, &images, &prompt)
        }
        Command::Inspect { model } => {
            let model = model
                .or(file_config.model)
                .context("no model given (--model or config file)")?;
            run_inspect(&model)
        }
        Command::Models => {
            for arch in registry::supported_architectures() {
                println!(
                    "{:<14} {:<14} multimodal={:<5} {}",
                    arch.display_name,
                    arch.model_type,
                    arch.multimodal,
                    arch.arch_names.join(", ")
                );
            }
            Ok(())
        }
    }
}

fn select_device(name: &str) -> anyhow::Result<Device> {
    Ok(match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => anyhow::bail!("Unknown device '{}'. Supported: cpu, cuda, metal", other),
    })
}

fn parse_dtype(name: &str, device: &Device) -> anyhow::Result<DType> {
    Ok(match name {
        "auto" if device.is_cpu() => DType::F32,
        "auto" | "bf16" | "bfloat16" => DType::BF16,
        "fp16" | "float16" | "half" => DType::F16,
        "fp32" | "float32" | "float" => DType::F32,
        other => anyhow::bail!(
            "Unknown dtype '{}'. Supported: auto, bf16, fp16, fp32",
            other
        ),
    })
}

/// Prefix the prompt with one `<image>` marker per image unless the user
/// placed them already.
fn image_prompt(prompt: &str, num_images: usize) -> String {
    if num_images == 0 || prompt.contains(DEFAULT_IMAGE_TOKEN) {
        return prompt.to_string();
    }
    format!("{}\n{prompt}", vec![DEFAULT_IMAGE_TOKEN; num_images].join("\n"))
}

fn run_generate(cfg: &CliConfig, image_paths: &[PathBuf], prompt: &str) -> anyhow::Result<()> {
    let model_id = cfg
        .model
        .as_deref()
        .context("no model given (--model or config file)")?;
    let device = select_device(cfg.device.as_deref().unwrap_or("cpu"))?;
    let dtype = parse_dtype(cfg.dtype.as_deref().unwrap_or("auto"), &device)?;

    let files = loader::fetch_model(model_id)?;
    let parsed = registry::global().load_config(&files.config)?;
    let text_config = parsed.text_config().clone();
    info!(model_id, model_type = parsed.model_type(), ?dtype, "loading model");

    let mut options = GenerateOptions::default()
        .with_max_new_tokens(cfg.max_new_tokens.unwrap_or(512))
        .with_sampling(SamplingParams {
            temperature: cfg.temperature.unwrap_or(0.0),
            top_p: cfg.top_p.unwrap_or(1.0),
            seed: cfg.seed,
            ..Default::default()
        });

    let model: Box<dyn CausalLm> = if parsed.model_type() == MODEL_TYPE {
        let llava_cfg = LlavaLlama3Config::from_json_value(&files.config)?;
        let tower = if loader::has_tensor_prefix(&files.weights, VISION_TOWER_PREFIX)? {
            None
        } else {
            match cfg
                .vision_tower
                .as_deref()
                .or(llava_cfg.multimodal().mm_vision_tower.as_deref())
            {
                Some(tower_id) => Some(loader::fetch_vision_tower(tower_id)?),
                None => None,
            }
        };
        let model = loader::load_llava_llama3(&files, tower.as_ref(), dtype, &device)?;

        if !image_paths.is_empty() {
            let backbone = model.get_model();
            let tower_cfg = backbone
                .encoder()
                .map(|e| e.tower().config().clone())
                .context("checkpoint has no vision tower; images cannot be used")?;
            let processor = ImageProcessor::for_tower(
                &tower_cfg,
                backbone.multimodal_config().image_aspect_ratio,
            );
            let decoded = image_paths
                .iter()
                .map(|p| processor.open(p))
                .collect::<Result<Vec<_>, _>>()?;
            let batch = processor.preprocess_batch(&decoded, dtype, &device)?;
            options = options.with_images(batch.pixel_values, Some(batch.image_sizes));
        }
        Box::new(model)
    } else {
        anyhow::ensure!(
            image_paths.is_empty(),
            "model type '{}' does not accept images",
            parsed.model_type()
        );
        loader::load_model(registry::global(), &files, dtype, &device)?
    };

    let tokenizer = TokenizerWrapper::from_file(&files.tokenizer)?;
    let template = match &files.tokenizer_config {
        Some(path) => ChatTemplateEngine::from_tokenizer_config(path)?,
        None => ChatTemplateEngine::llama3(),
    };

    let mut messages = Vec::new();
    if let Some(system) = &cfg.system_prompt {
        messages.push(ChatMessage::new("system", system.as_str()));
    }
    messages.push(ChatMessage::new(
        "user",
        image_prompt(prompt, image_paths.len()),
    ));
    let rendered = template.apply(&messages, true)?;
    // templates that render the BOS text already produce the BOS id
    let bos = if !template.bos_token().is_empty() && rendered.starts_with(template.bos_token()) {
        None
    } else {
        text_config.bos_token_id
    };
    let ids = tokenizer_image_token(&tokenizer, &rendered, bos)?;
    let prompt_len = ids.len();
    let input_ids = Tensor::new(ids.as_slice(), &device)?.unsqueeze(0)?;

    let mut eos = text_config.eos_token_ids();
    if let Some(eot) = tokenizer.token_to_id("<|eot_id|>") {
        if !eos.contains(&eot) {
            eos.push(eot);
        }
    }
    options = options.with_eos_token_ids(eos.clone());

    info!(prompt_len, images = image_paths.len(), "generating");
    let result = model.generate(Some(&input_ids), options)?;
    let generated: Vec<u32> = result
        .sequences()
        .get(0)?
        .to_vec1::<i64>()?
        .into_iter()
        .map_while(|id| u32::try_from(id).ok().filter(|id| !eos.contains(id)))
        .collect();
    info!(new_tokens = generated.len(), "done");
    println!("{}", tokenizer.decode(&generated)?);
    Ok(())
}

fn run_inspect(model_id: &str) -> anyhow::Result<()> {
    let files = loader::fetch_model(model_id)?;
    let parsed = registry::global().load_config(&files.config)?;
    let text = parsed.text_config();
    let arch = text
        .architectures
        .first()
        .and_then(|a| registry::find_architecture(a));

    println!("model_type:      {}", parsed.model_type());
    if let Some(arch) = arch {
        println!("architecture:    {}", arch.display_name);
    }
    println!(
        "decoder:         {} layers, hidden {}, heads {}/{} kv, vocab {}",
        text.num_hidden_layers,
        text.hidden_size,
        text.num_attention_heads,
        text.num_key_value_heads,
        text.vocab_size
    );
    println!("weights:         {} file(s)", files.weights.len());

    if parsed.model_type() == MODEL_TYPE {
        let cfg = LlavaLlama3Config::from_json_value(&files.config)?;
        let mm = cfg.multimodal();
        println!(
            "vision tower:    {}",
            mm.mm_vision_tower.as_deref().unwrap_or("<none>")
        );
        println!("projector:       {:?}", mm.mm_projector_type);
        println!(
            "select layer:    {} ({:?})",
            mm.mm_vision_select_layer, mm.mm_vision_select_feature
        );
        println!("aspect ratio:    {:?}", mm.image_aspect_ratio);
        println!("padding side:    {:?}", mm.tokenizer_padding_side);
        if let Some(tower) = mm.vision_encoder_config() {
            println!(
                "image tokens:    {} per {}px image",
                tower.num_patches(),
                tower.image_size
            );
        }
        println!(
            "tower in ckpt:   {}",
            loader::has_tensor_prefix(&files.weights, VISION_TOWER_PREFIX)?
        );
    }
    Ok(())
}
