// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(windows)]
mod imp {
    use std::path::PathBuf;

    use anyhow::Result;
    use structopt::StructOpt;

    use covrun::{LogSink, RunSettings, StartInfo};

    #[derive(Debug, StructOpt)]
    struct Opt {
        /// Target executable to measure.
        target: PathBuf,

        /// Arguments passed to the target.
        target_args: Vec<String>,

        /// Module path globs to measure (defaults to the target itself).
        #[structopt(long = "module")]
        modules: Vec<String>,

        /// Source path globs to measure (defaults to everything).
        #[structopt(long = "source")]
        sources: Vec<String>,

        /// Also print a Cobertura XML document.
        #[structopt(long)]
        cobertura: bool,
    }

    pub fn main() -> Result<()> {
        env_logger::init();

        let opt = Opt::from_args();

        let mut start_info = StartInfo::new(&opt.target)?;
        for arg in &opt.target_args {
            start_info.arg(arg);
        }

        let mut settings = RunSettings::default();
        settings.module_patterns.selected = if opt.modules.is_empty() {
            vec![start_info.path().to_string_lossy().into_owned()]
        } else {
            opt.modules.clone()
        };
        settings.source_patterns.selected = if opt.sources.is_empty() {
            vec!["*".to_string()]
        } else {
            opt.sources.clone()
        };

        let mut sink = LogSink;
        let run = covrun::run_coverage(&start_info, &settings, &mut sink)?;

        print!("{}", covrun::report::text_summary(&run));

        if opt.cobertura {
            println!("{}", covrun::report::cobertura_xml(&run)?);
        }

        Ok(())
    }
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    imp::main()
}

#[cfg(not(windows))]
fn main() {
    eprintln!("coverage recording requires Windows");
}
