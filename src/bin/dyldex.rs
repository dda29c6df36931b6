//! Single-image shared-cache extractor.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use dyld_cache_extractor::cache::DyldCache;
use dyld_cache_extractor::accelerator::Accelerator;
use dyld_cache_extractor::extract::{
    extract_image, find_image, list_images, ExtractionOptions, SkipModules,
};

#[derive(Parser)]
#[command(
    name = "dyldex",
    version,
    about = "Extracts a standalone Mach-O image from a dyld shared cache"
)]
struct Args {
    /// The path to the shared cache. If there are subcaches, give the
    /// directory containing them.
    cache_path: PathBuf,

    /// Enables debug logging messages.
    #[arg(short, long)]
    verbose: bool,

    /// Lists the images in the shared cache.
    #[arg(short, long)]
    list_images: bool,

    /// Filter images when listing.
    #[arg(short, long)]
    filter: Option<String>,

    /// Extract the image. Specify more of the path for conflicts in image
    /// names.
    #[arg(short, long)]
    extract: Option<String>,

    /// The output path for the extracted image. Required for extraction.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip certain modules. Most modules depend on each other, so use with
    /// caution. 1=slide-info, 2=linkedit, 4=stubs, 8=objc, 16=metadata-gen.
    #[arg(short, long, default_value_t = 0)]
    skip_modules: u32,

    /// Imbed this tool's version number into the mach header's reserved
    /// field. Only supports 64 bit images.
    #[arg(long)]
    imbed_version: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let cache = match DyldCache::open(&args.cache_path) {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if args.list_images {
        for (_, path) in list_images(&cache, args.filter.as_deref()) {
            println!("{path}");
        }
        return ExitCode::SUCCESS;
    }

    let Some(target) = args.extract else {
        eprintln!("nothing to do; use --list-images or --extract");
        return ExitCode::FAILURE;
    };
    let Some(output) = args.output else {
        eprintln!("Output path is required for extraction");
        return ExitCode::FAILURE;
    };

    // Architecture support is validated up front so unsupported caches fail
    // before any work happens.
    if let Err(err) = cache.arch() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let image_index = match find_image(&cache, &target) {
        Ok(index) => index,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    println!("Extracting '{}'", cache.image_path(&cache.images[image_index]));

    let options = ExtractionOptions {
        skip: SkipModules::from_bits_truncate(args.skip_modules),
        imbed_version: args.imbed_version,
    };

    let mut accel = Accelerator::new();
    match extract_image(&cache, &mut accel, image_index, &options) {
        Ok(extraction) => match extraction.write_to_path(&output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("unable to write output file: {err}");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("An error has occurred: {err}");
            ExitCode::FAILURE
        }
    }
}
