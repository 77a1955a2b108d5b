use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tsuzuri::minijinja::context;
use tsuzuri::{RenderOptions, Settings, TEMPLATE_EXT};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    Build,
    Serve,
}

impl From<Mode> for tsuzuri::Mode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Build => tsuzuri::Mode::Build,
            Mode::Serve => tsuzuri::Mode::Serve,
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct Args {
    #[clap(value_enum, index = 1, default_value = "build")]
    mode: Mode,
    /// Directory with the page templates.
    #[clap(long, default_value = "site")]
    root: Utf8PathBuf,
    #[clap(long, default_value = "dist")]
    dist: Utf8PathBuf,
    #[clap(long, default_value_t = 8080)]
    port: u16,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
struct Site {
    title: String,
    menu: Vec<MenuItem>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
struct MenuItem {
    href: String,
    label: String,
}

fn main() -> anyhow::Result<()> {
    tsuzuri::init_logging()?;

    let args = Args::parse();
    let site: Site = serde_json::from_str(&fs::read_to_string("site.json")?)?;

    let options = RenderOptions::default().context_fn(move |paths| {
        context! {
            site => site,
            page => paths.relative,
        }
    });

    let plugins = Settings::new()
        .build_options(options.clone())
        .serve_options(options)
        .ignore_pattern("/drafts/**")
        .finish()?;

    match args.mode.into() {
        tsuzuri::Mode::Build => {
            let mut adapter = plugins.build;
            adapter.config_resolved(&args.root)?;

            let mut entries = Vec::new();
            collect_templates(adapter.root(), adapter.root(), &mut entries)?;
            // Layouts are only ever included.
            entries.retain(|entry| !entry.starts_with("layouts/"));

            tokio::runtime::Builder::new_current_thread()
                .build()?
                .block_on(tsuzuri::bundle(&adapter, &entries, &args.dist))?;
        }
        tsuzuri::Mode::Serve => {
            tsuzuri::server::serve(plugins.serve, &args.root, args.port)?;
        }
    }

    Ok(())
}

fn collect_templates(
    root: &Utf8Path,
    dir: &Utf8Path,
    entries: &mut Vec<String>,
) -> anyhow::Result<()> {
    for entry in dir.read_dir_utf8()? {
        let path = entry?.into_path();

        if path.is_dir() {
            collect_templates(root, &path, entries)?;
        } else if path.extension() == Some(TEMPLATE_EXT) {
            entries.push(path.strip_prefix(root)?.to_string());
        }
    }

    Ok(())
}
