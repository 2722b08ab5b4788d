//! Fault-injection probe for exercising the crash handler end-to-end.
//!
//! Installs the handler, then triggers the requested fault. Exists so
//! the integration tests can observe real signal delivery, log output,
//! and killed-by-signal exit statuses from a disposable subprocess.

#[cfg(unix)]
fn main() {
    probe::run();
}

/// The handler is a no-op on non-unix targets and there is no signal
/// delivery to observe; the binary still has to build there.
#[cfg(not(unix))]
fn main() {
    eprintln!("crashprobe: fatal-signal faults require a unix target");
    std::process::exit(1);
}

#[cfg(unix)]
mod probe {
    use clap::{Parser, ValueEnum};

    #[derive(Parser, Debug)]
    #[command(name = "crashprobe", version, about = "Trigger a fault with the crash handler installed")]
    struct Cli {
        /// Fault to trigger after installing the crash handler
        #[arg(value_enum)]
        fault: Fault,

        /// Skip crash-file preparation (handler must degrade gracefully)
        #[arg(long)]
        no_crash_file: bool,
    }

    #[derive(Debug, Clone, Copy, ValueEnum)]
    enum Fault {
        /// Dereference a null pointer (SIGSEGV at address 0)
        NullDeref,
        /// Raise SIGBUS
        Bus,
        /// Raise SIGILL
        Ill,
        /// Raise SIGFPE
        Fpe,
        /// Call std::process::abort (SIGABRT)
        Abort,
        /// Exhaust the thread stack by deep recursion (SIGSEGV on the
        /// guard page; exercises the alternate signal stack)
        StackOverflow,
        /// Fault simultaneously on two threads (exactly one crash report)
        Race,
        /// Deliberate termination via crashguard::crash
        Explicit,
        /// Deliberate termination via crashguard::assertion_failure
        Assertion,
    }

    pub(super) fn run() {
        let cli = Cli::parse();

        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_writer(std::io::stderr)
            .init();

        crashguard::install_crash_handler();
        if !cli.no_crash_file {
            crashguard::set_temp_filename();
        }

        tracing::info!(fault = ?cli.fault, "crashprobe armed, triggering fault");

        match cli.fault {
            Fault::NullDeref => null_deref(),
            Fault::Bus => raise(nix::sys::signal::Signal::SIGBUS),
            Fault::Ill => raise(nix::sys::signal::Signal::SIGILL),
            Fault::Fpe => raise(nix::sys::signal::Signal::SIGFPE),
            Fault::Abort => std::process::abort(),
            Fault::StackOverflow => {
                gobble(0);
            }
            Fault::Race => race(),
            Fault::Explicit => crashguard::crash("probe-requested crash"),
            Fault::Assertion => crashguard::assertion_failure(file!(), line!(), "probe invariant"),
        }

        // Every arm above must kill the process.
        unreachable!("fault did not terminate the process");
    }

    fn null_deref() {
        unsafe {
            std::ptr::null_mut::<u8>().write_volatile(1);
        }
    }

    fn raise(sig: nix::sys::signal::Signal) {
        let _ = nix::sys::signal::raise(sig);
    }

    /// Burn stack until the guard page faults. The local array and
    /// black_box keep the recursion from being optimized into a loop.
    #[allow(unconditional_recursion)]
    fn gobble(depth: u64) -> u64 {
        let mut pad = [0u8; 4096];
        pad[0] = (depth & 0xff) as u8;
        std::hint::black_box(&mut pad);
        gobble(depth + 1) + u64::from(pad[4095])
    }

    /// Two threads fault inside the same small window; the re-entrancy
    /// guard must let exactly one of them write the crash report. The
    /// threads use different signals: the handler is one-shot per
    /// signal, so a second fault on the same signal would bypass it for
    /// default handling instead of exercising the guard.
    fn race() {
        let barrier = std::sync::Barrier::new(2);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                null_deref();
            });
            scope.spawn(|| {
                barrier.wait();
                raise(nix::sys::signal::Signal::SIGFPE);
            });
        });
    }
}
