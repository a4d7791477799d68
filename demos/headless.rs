use std::sync::Arc;
use std::time::Duration;
use tilepyramid::prelude::*;

/// Loads a few frames from OpenStreetMap without any UI and reports what a
/// renderer would have painted. Tiles land in a disk cache which is exported
/// to an archive at the end.
///
/// ```text
/// cargo run --example headless -- [cache-dir]
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cache_dir = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("tilepyramid-headless"));

    let provider = Arc::new(HttpTileProvider::openstreetmap());
    let mut session = MapSession::builder(provider)
        .with_profile(LoaderProfile::LowResource)
        .with_disk_store(&cache_dir)
        .build()?;
    let events = session.events();

    println!("Tile pyramid headless demo");
    println!("cache: {}", cache_dir.display());

    let viewport = PixelSize::new(800, 600);
    let locations = [
        ("Vilnius", GeoPoint::new(54.6872, 25.2797), 12),
        ("London", GeoPoint::new(51.5074, -0.1278), 10),
        ("Tokyo", GeoPoint::new(35.6762, 139.6503), 11),
    ];

    for (name, center, zoom) in locations {
        let evicted = session.set_zoom(zoom);
        let plan = session.request_visible(center, zoom, viewport);
        println!(
            "\n{} at zoom {}: {} tiles planned ({} evicted)",
            name,
            zoom,
            plan.tiles.len(),
            evicted
        );

        if session.pending_count() > 0 {
            wait_for_queue(&events).await;
        }

        let mut painted = 0;
        let mut fallbacks = 0;
        let mut placeholders = 0;
        for planned in &plan.tiles {
            let tile = session.get_tile_for_draw(zoom, planned.pos);
            if tile.needs_placeholder() {
                placeholders += 1;
            } else if tile.is_fallback {
                fallbacks += 1;
            } else {
                painted += 1;
            }
        }
        println!(
            "  painted {}, from ancestors {}, placeholders {}",
            painted, fallbacks, placeholders
        );
    }

    let stats = session.stats();
    println!(
        "\nrequests {}, network {}, store hits {}, failed {}, retries {}",
        stats.requested, stats.network_fetches, stats.store_hits, stats.failed, stats.retries
    );

    let archive = cache_dir.with_extension("tpyr");
    let exported = session.export_cache(&archive)?;
    println!("exported {} tiles to {}", exported, archive.display());

    Ok(())
}

async fn wait_for_queue(events: &crossbeam_channel::Receiver<TileEvent>) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        while let Ok(event) = events.try_recv() {
            match event {
                TileEvent::LoadFailed { key, error } => println!("  {} failed: {}", key, error),
                TileEvent::QueueDrained { elapsed } => {
                    println!("  queue drained in {:?}", elapsed);
                    return;
                }
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("  gave up waiting for tiles");
}
