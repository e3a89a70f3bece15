// ============================================================================
// pixelmap CLI - headless map maintenance
// ============================================================================
//
// Usage examples:
//   pixelmap new 12 --grid 120x68 --tile 32
//   pixelmap info saved_maps/map_0012.json
//   pixelmap render 12 --region 0,0,20,12 --output preview.png
//   pixelmap delete "saved_maps/map_*.json" --region 4,4,2,2
//   pixelmap convert old_export.json --output saved_maps/map_0013.json
//   pixelmap tiles --region 0,0,30,30 --tile 32 --cap 400
//
// A MAP argument is a numeric id (saved_maps/map_NN.json, then map_NNNN.json),
// a glob (the last match in sorted order is used) or a file path.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use pixelmap::document::detect_schema;
use pixelmap::generator::Unconfigured;
use pixelmap::grid::parse_grid;
use pixelmap::service::RegionBody;
use pixelmap::settings::{SAVED_MAPS_DIR, is_map_id, map_id_path, map_path};
use pixelmap::storage::DirStorage;
use pixelmap::tiler::{cap_cells, tile_region};
use pixelmap::{Compositor, LayerId, MapDocument, MapError, MapResult, MapService, Settings};
use pixelmap::{log_err, log_info};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// Sparse tile maps with generated image patches.
#[derive(Parser, Debug)]
#[command(name = "pixelmap", version, about = "Inspect, render and edit pixelmap documents")]
pub struct CliArgs {
    /// Settings file (key=value). Defaults to the platform config directory.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Mirror the session log to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty map.
    New {
        /// Target path or numeric id.
        map: String,
        /// Grid size as WxH; defaults to the configured size.
        #[arg(long, value_name = "WxH")]
        grid: Option<String>,
        /// Tile edge in pixels; defaults to the configured size.
        #[arg(long, value_parser = clap::value_parser!(u32).range(8..))]
        tile: Option<u32>,
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print a summary of a map.
    Info { map: String },
    /// Composite a region of a map to a PNG file.
    Render {
        map: String,
        #[command(flatten)]
        region: RegionArg,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Directory holding the patch images; defaults to the configured one.
        #[arg(long, value_name = "DIR")]
        patch_dir: Option<PathBuf>,
    },
    /// Remove every patch intersecting a region.
    Delete {
        map: String,
        #[command(flatten)]
        region: RegionArg,
        #[arg(long, value_name = "DIR")]
        patch_dir: Option<PathBuf>,
    },
    /// Re-save a map of any known schema in the current one.
    Convert {
        map: String,
        /// Destination; defaults to overwriting the input.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Show how a region would be split into generator requests.
    Tiles {
        #[command(flatten)]
        region: RegionArg,
        #[arg(long, value_parser = clap::value_parser!(u32).range(8..))]
        tile: Option<u32>,
        /// Cap in pixels; defaults to the configured generate cap.
        #[arg(long)]
        cap: Option<u32>,
        /// Use the inpaint cap instead of the generate cap.
        #[arg(long, conflicts_with = "cap")]
        inpaint: bool,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct RegionArg {
    /// Cell region as x,y,w,h.
    #[arg(short, long, value_name = "X,Y,W,H", value_parser = parse_region)]
    pub region: RegionBody,
}

fn parse_region(s: &str) -> Result<RegionBody, String> {
    let parts: Vec<i64> = s
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("expected X,Y,W,H integers, got '{}'", s))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(RegionBody { x: *x, y: *y, w: *w, h: *h }),
        _ => Err(format!("expected four values X,Y,W,H, got '{}'", s)),
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one subcommand and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = Settings::load(args.config.as_deref());
    let start = Instant::now();
    let result = match args.command {
        Command::New { map, grid, tile, force } => cmd_new(&settings, &map, grid.as_deref(), tile, force),
        Command::Info { map } => cmd_info(&map),
        Command::Render {
            map,
            region,
            output,
            patch_dir,
        } => cmd_render(&settings, &map, region.region, &output, patch_dir),
        Command::Delete { map, region, patch_dir } => cmd_delete(&settings, &map, region.region, patch_dir),
        Command::Convert { map, output } => cmd_convert(&map, output),
        Command::Tiles {
            region,
            tile,
            cap,
            inpaint,
        } => cmd_tiles(&settings, region.region, tile, cap, inpaint),
    };

    match result {
        Ok(()) => {
            log_info!("CLI: done in {:.2}s", start.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_err!("CLI: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Subcommands
// ============================================================================

fn cmd_new(settings: &Settings, map: &str, grid: Option<&str>, tile: Option<u32>, force: bool) -> MapResult<()> {
    let path = target_path(map);
    if path.exists() && !force {
        return Err(MapError::InvalidFormat(format!(
            "{} already exists (use --force to replace it)",
            path.display()
        )));
    }
    let (w, h) = match grid {
        Some(g) => parse_grid(g)?,
        None => (settings.grid_width, settings.grid_height),
    };
    let doc = MapDocument::new(tile.unwrap_or(settings.tile_size), w, h);
    doc.save(&path)?;
    println!(
        "created {} ({}x{} cells, tile {}px)",
        path.display(),
        doc.grid_width,
        doc.grid_height,
        doc.tile_size
    );
    Ok(())
}

fn cmd_info(map: &str) -> MapResult<()> {
    let path = resolve_map(map)?;
    let raw: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    let doc = MapDocument::from_json_value(&raw)?;

    println!("{}", path.display());
    println!("  schema:  {}", detect_schema(&raw).unwrap_or("empty"));
    println!("  version: {}", doc.version);
    println!(
        "  grid:    {}x{} cells, tile {}px ({}x{}px)",
        doc.grid_width,
        doc.grid_height,
        doc.tile_size,
        pixel_extent(doc.grid_width, doc.tile_size),
        pixel_extent(doc.grid_height, doc.tile_size)
    );
    for id in LayerId::all() {
        println!("  {:<18} {}", id.name(), doc.layers.layer(*id).len());
    }
    println!("  {:<18} {}", "patches", doc.patches.len());
    for issue in doc.validate() {
        println!("  warning: {}", issue);
    }
    Ok(())
}

fn cmd_render(
    settings: &Settings,
    map: &str,
    region: RegionBody,
    output: &Path,
    patch_dir: Option<PathBuf>,
) -> MapResult<()> {
    let path = resolve_map(map)?;
    let doc = load_existing(&path)?;
    let rect = doc.region(region.x, region.y, region.w, region.h)?;
    let storage = DirStorage::new(patch_dir.unwrap_or_else(|| settings.patch_dir.clone()));

    let img = Compositor::new(doc.tile_size, &storage).render(&doc.patches, rect)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    img.save_with_format(output, image::ImageFormat::Png)?;
    println!(
        "rendered {} of {} ({}x{}px, {} patches) -> {}",
        rect,
        path.display(),
        img.width(),
        img.height(),
        doc.patches.query_intersecting(&rect).len(),
        output.display()
    );
    Ok(())
}

fn cmd_delete(settings: &Settings, map: &str, region: RegionBody, patch_dir: Option<PathBuf>) -> MapResult<()> {
    let path = resolve_map(map)?;
    let doc = load_existing(&path)?;
    let storage = DirStorage::new(patch_dir.unwrap_or_else(|| settings.patch_dir.clone()));
    let service =
        MapService::new(doc, Arc::new(storage), Arc::new(Unconfigured::default())).with_state_path(&path);

    let outcome = service.delete(&region)?;
    for patch in &outcome.removed {
        println!("removed {} {}", patch.file(), patch.bounds);
    }
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    println!("{} removed, {} left", outcome.removed.len(), outcome.left);
    Ok(())
}

fn cmd_convert(map: &str, output: Option<PathBuf>) -> MapResult<()> {
    let path = resolve_map(map)?;
    let raw: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    let schema = detect_schema(&raw).unwrap_or("empty");
    let doc = MapDocument::from_json_value(&raw)?;
    for issue in doc.validate() {
        eprintln!("warning: {}", issue);
    }
    let out = output.unwrap_or_else(|| path.clone());
    doc.save(&out)?;
    println!("{} ({}) -> {} (current)", path.display(), schema, out.display());
    Ok(())
}

fn cmd_tiles(settings: &Settings, region: RegionBody, tile: Option<u32>, cap: Option<u32>, inpaint: bool) -> MapResult<()> {
    let tile = tile.unwrap_or(settings.tile_size);
    let cap_px = match (cap, inpaint) {
        (Some(c), _) => c,
        (None, true) => settings.inp_max_px,
        (None, false) => settings.gen_max_px,
    };
    // No map to check against; only the extent is validated.
    let width = region.x.saturating_add(region.w).max(1);
    let height = region.y.saturating_add(region.h).max(1);
    let grid_w = u32::try_from(width).unwrap_or(u32::MAX);
    let grid_h = u32::try_from(height).unwrap_or(u32::MAX);
    let rect = pixelmap::CellRect::checked(region.x, region.y, region.w, region.h, grid_w, grid_h)?;

    let tiles = tile_region(rect, tile, cap_px);
    println!(
        "{} at {}px tiles, cap {}px ({} cells): {} requests",
        rect,
        tile,
        cap_px,
        cap_cells(cap_px, tile),
        tiles.len()
    );
    for (i, sub) in tiles.enumerate() {
        let (pw, ph) = sub.pixel_size(tile);
        println!("  {:>3}. {} {}x{}px", i + 1, sub, pw, ph);
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn load_existing(path: &Path) -> MapResult<MapDocument> {
    MapDocument::load(path)?.ok_or_else(|| MapError::ResourceMissing(path.display().to_string()))
}

/// Cells times tile edge, widened so large grids cannot wrap.
fn pixel_extent(cells: u32, tile_size: u32) -> u64 {
    cells as u64 * tile_size as u64
}

/// Where `new` writes: numeric ids map into the saved-maps directory,
/// anything else is taken as a path.
fn target_path(map: &str) -> PathBuf {
    if is_map_id(map) { map_path(map) } else { PathBuf::from(map) }
}

/// Resolve a MAP argument to an existing file. Lookup order: numeric id as
/// `map_NN.json` then `map_NNNN.json`, glob (lexicographically last match),
/// literal path, then a name inside the saved-maps directory.
fn resolve_map(map: &str) -> MapResult<PathBuf> {
    if is_map_id(map) {
        for digits in [2, 4] {
            let path = map_id_path(map, digits);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    if map.contains(['*', '?']) {
        let entries =
            glob::glob(map).map_err(|e| MapError::InvalidFormat(format!("invalid glob '{}': {}", map, e)))?;
        let mut matches: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
        matches.sort();
        return matches
            .pop()
            .ok_or_else(|| MapError::ResourceMissing(format!("no map matches '{}'", map)));
    }
    let as_path = Path::new(map);
    if as_path.exists() {
        return Ok(as_path.to_path_buf());
    }
    let saved = Path::new(SAVED_MAPS_DIR).join(map);
    if saved.exists() {
        return Ok(saved);
    }
    Err(MapError::ResourceMissing(format!("no map '{}'", map)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region() {
        let r = parse_region("1, 2,3,4").unwrap();
        assert_eq!((r.x, r.y, r.w, r.h), (1, 2, 3, 4));
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("a,b,c,d").is_err());
        assert!(parse_region("-1,0,2,2").is_ok());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_subcommands_parse() {
        let args = CliArgs::parse_from(["pixelmap", "tiles", "--region", "0,0,5,5", "--tile", "32", "--cap", "64"]);
        match args.command {
            Command::Tiles { region, tile, cap, inpaint } => {
                assert_eq!((region.region.w, region.region.h), (5, 5));
                assert_eq!(tile, Some(32));
                assert_eq!(cap, Some(64));
                assert!(!inpaint);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(CliArgs::try_parse_from(["pixelmap", "new", "3", "--tile", "4"]).is_err());
    }

    #[test]
    fn test_map_ids_resolve_into_saved_maps() {
        assert_eq!(target_path("12"), PathBuf::from("saved_maps/map_0012.json"));
        assert_eq!(target_path("maps/a.json"), PathBuf::from("maps/a.json"));
    }

    #[test]
    fn test_pixel_extent_does_not_wrap() {
        assert_eq!(pixel_extent(120, 32), 3840);
        assert_eq!(pixel_extent(u32::MAX, 64), u32::MAX as u64 * 64);
    }

    #[test]
    fn test_resolve_map_takes_last_glob_match() {
        let dir = std::env::temp_dir().join(format!("pixelmap-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        // Written last but sorts first.
        std::fs::write(dir.join("map_b.json"), "{}").unwrap();
        std::fs::write(dir.join("map_a.json"), "{}").unwrap();

        let pattern = dir.join("map_*.json");
        let found = resolve_map(&pattern.to_string_lossy()).unwrap();
        assert_eq!(found, dir.join("map_b.json"));
        assert!(matches!(
            resolve_map(&dir.join("none_*.json").to_string_lossy()),
            Err(MapError::ResourceMissing(_))
        ));
        assert!(matches!(
            resolve_map(&dir.join("absent.json").to_string_lossy()),
            Err(MapError::ResourceMissing(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
