use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use gadget_image::builder::{Builder, Stop};
use gadget_image::config::{BuildConfig, Flavor, ImageSize};
use gadget_image::error::{
    DependencyError, GadgetSpecError, HookError, LayoutError, PrivilegeError,
};
use gadget_image::preflight;
use gadget_image::state_machine::Target;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  gadget-image [snap] [OPTIONS] <model-assertion>\n  gadget-image classic [OPTIONS] <gadget-tree>\n  gadget-image [snap|classic] --resume -w <workdir> [-u STEP|-t STEP]\n\n\
     Common options:\n  -d, --debug                 verbose logging\n  -c, --config <toml>         build config file; flags override it\n  \
     -i, --image-size <size>     4G, or per volume: 0:4G,name:2G\n  --image-file-list <file>    write produced image paths here\n  \
     --cloud-init <file>         cloud-init user-data\n  --hooks-directory <dirs>    comma separated hook directories\n  \
     --disk-info <file>          copied to .disk/info in the rootfs\n  -O, --output-dir <dir>      image output directory\n  \
     -o, --output <file>         image path (single-volume gadgets)\n  -w, --workdir <dir>         persistent work directory\n  \
     -u, --until <step>          stop before this step (name or index)\n  -t, --thru <step>           stop after this step (name or index)\n  \
     -r, --resume                continue a checkpointed build\n\n\
     Snap options:\n  --snap <snap>               extra snap (repeatable)\n  --channel <channel>\n  \
     --disable-console-conf\n  --factory-image\n\n\
     Classic options:\n  -p, --project <name>\n  -f, --filesystem <dir>      prebuilt rootfs instead of live-build\n  \
     -s, --suite <suite>\n  -a, --arch <arch>\n  --subproject <name>\n  --subarch <name>\n  \
     --with-proposed\n  --extra-ppas <ppas>         comma separated"
}

#[derive(Debug)]
struct Cli {
    config: BuildConfig,
    resume: bool,
    stop: Option<Stop>,
}

enum Parsed {
    Help,
    Run(Box<Cli>),
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Parsed::Help) => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Ok(Parsed::Run(cli)) => cli,
        Err(err) => {
            eprintln!("error: {:#}\n\n{}", err, usage());
            return ExitCode::from(1);
        }
    };

    init_tracing(cli.config.debug);
    match run(*cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut builder = if cli.resume {
        let workdir = cli
            .config
            .workdir
            .as_deref()
            .context("--resume requires --workdir")?;
        Builder::resume(workdir)?
    } else {
        Builder::new(cli.config)?
    };
    preflight::check_build_tools(&builder.state().config)?;

    builder.run(cli.stop.as_ref())?;
    if let Some(path) = builder.save_checkpoint()? {
        info!("Saved build state to {}", path.display());
    }

    let record = builder.record();
    if record.done {
        if let Some(list) = &builder.state().config.image_file_list {
            write_image_file_list(list, &record.images)?;
        }
        for image in &record.images {
            println!("{}", image.display());
        }
    }
    builder.close()
}

fn write_image_file_list(path: &Path, images: &[PathBuf]) -> Result<()> {
    let mut text = String::new();
    for image in images {
        text.push_str(&image.to_string_lossy());
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("writing image list '{}'", path.display()))
}

/// Print the most specific diagnostic found in the error chain.
fn report(err: &anyhow::Error) {
    for e in err.chain() {
        if let Some(spec) = e.downcast_ref::<GadgetSpecError>() {
            eprintln!("gadget.yaml parse error: {}", spec);
            eprintln!("Use --debug for more information");
            return;
        }
        if let Some(layout) = e.downcast_ref::<LayoutError>() {
            eprintln!("{}", layout);
            return;
        }
        if let Some(hook) = e.downcast_ref::<HookError>() {
            eprintln!("{}", hook);
            return;
        }
        if let Some(privilege) = e.downcast_ref::<PrivilegeError>() {
            eprintln!("{}", privilege);
            return;
        }
        if let Some(dependency) = e.downcast_ref::<DependencyError>() {
            eprintln!("{}", dependency);
            return;
        }
    }
    eprintln!("Crash in state machine: {:#}", err);
}

fn parse_args(args: &[String]) -> Result<Parsed> {
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        return Ok(Parsed::Help);
    }
    let (mut config, rest) = match args.first().map(String::as_str) {
        Some("snap") => (BuildConfig::snap(), &args[1..]),
        Some("classic") => (BuildConfig::classic(), &args[1..]),
        _ => {
            eprintln!("Warning: for backwards compatibility, `gadget-image` falls back to `gadget-image snap` if no subcommand is given");
            (BuildConfig::snap(), args)
        }
    };

    // The config file is the base layer; every flag overrides it.
    if let Some(path) = config_file(rest)? {
        config.apply_file(&path)?;
    }

    let mut resume = false;
    let mut until = None;
    let mut thru = None;
    let mut positional = None;
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = || -> Result<String> {
            match &inline {
                Some(value) => Ok(value.clone()),
                None => iter
                    .next()
                    .cloned()
                    .with_context(|| format!("{} needs a value", flag)),
            }
        };
        match (flag, &mut config.flavor) {
            ("-c" | "--config", _) => {
                value()?;
            }
            ("-d" | "--debug", _) => config.debug = true,
            ("-r" | "--resume", _) => resume = true,
            ("-u" | "--until", _) => until = Some(value()?),
            ("-t" | "--thru", _) => thru = Some(value()?),
            ("-i" | "--image-size", _) => config.image_size = Some(ImageSize::parse(&value()?)?),
            ("--image-file-list", _) => config.image_file_list = Some(value()?.into()),
            ("--cloud-init", _) => config.cloud_init = Some(value()?.into()),
            ("--disk-info", _) => config.disk_info = Some(value()?.into()),
            ("--hooks-directory", _) => {
                config.hooks_directories = split_list(&value()?).map(PathBuf::from).collect();
            }
            ("-O" | "--output-dir", _) => config.output_dir = Some(value()?.into()),
            ("-o" | "--output", _) => config.output = Some(value()?.into()),
            ("-w" | "--workdir", _) => config.workdir = Some(value()?.into()),
            ("--snap", Flavor::Snap(options)) => options.snaps.push(value()?),
            ("--channel", Flavor::Snap(options)) => options.channel = Some(value()?),
            ("--disable-console-conf", Flavor::Snap(options)) => {
                options.disable_console_conf = true;
            }
            ("--factory-image", Flavor::Snap(options)) => options.factory_image = true,
            ("-p" | "--project", Flavor::Classic(options)) => options.project = Some(value()?),
            ("-f" | "--filesystem", Flavor::Classic(options)) => {
                options.filesystem = Some(value()?.into());
            }
            ("-s" | "--suite", Flavor::Classic(options)) => options.suite = Some(value()?),
            ("-a" | "--arch", Flavor::Classic(options)) => options.arch = Some(value()?),
            ("--subproject", Flavor::Classic(options)) => options.subproject = Some(value()?),
            ("--subarch", Flavor::Classic(options)) => options.subarch = Some(value()?),
            ("--with-proposed", Flavor::Classic(options)) => options.with_proposed = true,
            ("--extra-ppas", Flavor::Classic(options)) => {
                options.extra_ppas = split_list(&value()?).map(str::to_string).collect();
            }
            (other, flavor) if other.starts_with('-') => {
                bail!("unknown option '{}' for {} images", other, flavor.name())
            }
            (other, _) => {
                if positional.is_some() {
                    bail!("unexpected argument '{}'", other);
                }
                positional = Some(PathBuf::from(other));
            }
        }
    }

    let stop = match (until, thru) {
        (Some(_), Some(_)) => bail!("--until and --thru cannot be used together"),
        (Some(step), None) => Some(Stop::Until(Target::parse(&step))),
        (None, Some(step)) => Some(Stop::Thru(Target::parse(&step))),
        (None, None) => None,
    };

    if resume {
        if config.workdir.is_none() {
            bail!("--resume requires --workdir");
        }
        if positional.is_some() {
            bail!("--resume does not take a model assertion or gadget tree");
        }
    } else {
        let source = positional.context(match config.flavor {
            Flavor::Snap(_) => "missing model assertion",
            Flavor::Classic(_) => "missing gadget tree",
        })?;
        match &mut config.flavor {
            Flavor::Snap(options) => options.model_assertion = Some(source),
            Flavor::Classic(options) => options.gadget_tree = Some(source),
        }
    }
    Ok(Parsed::Run(Box::new(Cli {
        config,
        resume,
        stop,
    })))
}

fn config_file(args: &[String]) -> Result<Option<PathBuf>> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
        if arg == "-c" || arg == "--config" {
            let path = iter.next().with_context(|| format!("{} needs a value", arg))?;
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}
