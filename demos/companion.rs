//! companion demo: one reply per companion state from a local GGUF model.
//!
//! Streams each reply as it is generated, then prints a summary. The
//! tokenizer.json must belong to the same model as the GGUF file.

#[cfg(feature = "llama-cpp")]
fn main() {
    use companion_infer::backend::llama_cpp::LlamaCppBackend;
    use companion_infer::{
        CompanionState, GenerationConfig, GenerationController, Scheduler, Tokenizer,
    };
    use std::io::Write;
    use std::sync::Arc;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(model_path), Some(tokenizer_path)) = (args.next(), args.next()) else {
        eprintln!("Usage: companion <model.gguf> <tokenizer.json> [config.json]");
        std::process::exit(1);
    };

    let config = match args.next() {
        Some(path) => {
            let json = std::fs::read_to_string(&path).expect("Failed to read config");
            GenerationConfig::from_json_str(&json).expect("Invalid config")
        }
        None => GenerationConfig::default(),
    };

    let tokenizer = Arc::new(Tokenizer::from_file(&tokenizer_path).expect("Failed to load tokenizer"));

    print!("Loading model... ");
    std::io::stdout().flush().unwrap();
    let t0 = std::time::Instant::now();
    let mut backend = LlamaCppBackend::load_gguf(
        &model_path,
        u32::MAX,
        config.max_sequence_length as u32,
    )
    .expect("Failed to load model");
    println!("OK ({:.1}s)", t0.elapsed().as_secs_f64());
    println!("  Model: {}", backend.model_config().name);
    println!("  Vocab: {} (tokenizer: {})", backend.model_config().vocab_size, tokenizer.vocab_size());
    println!();

    let scheduler = Scheduler::from_config(&config);
    let mut controller = GenerationController::new(tokenizer, config).expect("Invalid config");

    for state in CompanionState::ALL {
        controller.generate(state).expect("prompt rejected");
        print!("[{state}] ");
        std::io::stdout().flush().unwrap();

        let t0 = std::time::Instant::now();
        let mut shown = 0;
        while controller.is_generating() {
            if let Err(e) = controller.step(&mut backend) {
                eprintln!("\n  step failed: {e}");
                break;
            }
            let partial = controller.last_response();
            if partial.len() > shown && partial.is_char_boundary(shown) {
                print!("{}", &partial[shown..]);
                std::io::stdout().flush().unwrap();
                shown = partial.len();
            }
        }

        println!();
        println!(
            "  {} tokens in {} ms, stopped: {:?}",
            controller.generated_tokens().len(),
            t0.elapsed().as_millis(),
            controller.stop_reason()
        );
        println!();
    }

    // Same thing through the scheduler, with the configured deadline.
    controller.set_state(CompanionState::Follow).expect("prompt rejected");
    if controller.is_generating() {
        match scheduler.run_blocking(&mut controller, &mut backend) {
            Ok(reason) => println!("[scheduled] {:?}: {}", reason, controller.last_response()),
            Err(e) => eprintln!("[scheduled] failed: {e}"),
        }
    }
}

#[cfg(not(feature = "llama-cpp"))]
fn main() {
    eprintln!("This example requires the 'llama-cpp' feature.");
    eprintln!(
        "Run with: cargo run --example companion --features llama-cpp -- <model.gguf> <tokenizer.json>"
    );
    std::process::exit(1);
}
