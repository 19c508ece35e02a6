use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use ptrace_dlfcn::{Injector, Process, RTLD_LAZY, RTLD_NOW};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,

    /// Name of a process to attach to.
    #[arg(short, long, group = "target")]
    name: Option<String>,

    /// PID of a process to attach to.
    #[arg(short, long, group = "target")]
    pid: Option<u32>,

    /// Resolve symbols lazily instead of at load time.
    #[arg(long)]
    lazy: bool,

    /// Symbol to look up in the loaded library, printed with its address.
    #[arg(short, long)]
    symbol: Option<String>,

    /// Unload the library again before detaching.
    #[arg(short, long)]
    unload: bool,

    /// Path to the library to load.
    #[arg(requires = "target")]
    library: std::path::PathBuf,
}

impl Args {
    fn run(self) -> Result<()> {
        pretty_env_logger::formatted_builder()
            .filter_level(self.verbose.log_level_filter())
            .init();
        let process = if let Some(name) = self.name {
            Process::by_name(&name)?
                .ok_or_else(|| eyre!("could not find process with name {name:?}"))?
        } else if let Some(pid) = self.pid {
            Process::get(pid)?
        } else {
            panic!("no target specified, but clap should have caught this");
        };

        let flag = if self.lazy { RTLD_LAZY } else { RTLD_NOW };
        let mut injector = Injector::attach(process)?;
        let handle = injector.dlopen(&self.library, flag)?;
        if handle == 0 {
            return Err(eyre!(
                "the loader in the target refused to load {}",
                self.library.display()
            ));
        }
        println!("loaded {} as handle {handle:#x}", self.library.display());

        if let Some(symbol) = &self.symbol {
            let address = injector.dlsym(handle, symbol)?;
            if address == 0 {
                println!("{symbol} is not exported by the loaded library");
            } else {
                println!("{symbol} = {address:#x}");
            }
        }

        if self.unload {
            injector.dlclose(handle)?;
            println!("unloaded handle {handle:#x}");
        }

        injector.resume()
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    Args::parse().run()
}
