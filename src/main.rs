use rand::rngs::StdRng;
use rand::SeedableRng;
use trailnet::identity::PeerId;
use trailnet::Config;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Trailnet Node Startup");
    println!("=====================\n");

    // Load configuration from standard search paths
    println!("1. Loading configuration...");
    println!("   Search paths (in priority order, lowest to highest):");
    for path in Config::search_paths() {
        let status = if path.exists() { "[found]" } else { "[not found]" };
        println!("   {} {}", status, path.display());
    }
    println!();

    let (config, loaded_paths) = match Config::load() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("   Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    if loaded_paths.is_empty() {
        println!("   No config files found, using defaults.");
    } else {
        println!("   Loaded {} config file(s):", loaded_paths.len());
        for path in &loaded_paths {
            println!("   - {}", path.display());
        }
    }

    println!("\n2. Initializing identity...");
    let mut rng = StdRng::from_entropy();
    let my_id = PeerId::random(&mut rng);
    println!("   peer id: {}", my_id);

    println!("\n3. Routing parameters:");
    println!("   layers:            {}", config.routing.layers());
    println!("   fingers per layer: {}", config.routing.fingers_per_layer());
    println!(
        "   trail timeout:     {}s",
        config.routing.trail_timeout_ms() / 1000
    );
    println!(
        "   walk interval:     {}s",
        config.routing.walk_interval_ms() / 1000
    );
    println!(
        "   ats backoff cap:   {}s",
        config.ats.backoff_cap_ms() / 1000
    );

    println!("\nReady.");
}
