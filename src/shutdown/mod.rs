use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Process signal flags polled by the driver loop between `run_once` calls.
///
/// SIGINT/SIGTERM request shutdown; SIGHUP requests a cluster table reload.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            let id_hup = flag::register(SIGHUP, Arc::clone(&reload))?;
            return Ok(Self {
                triggered,
                reload,
                sig_ids: vec![id_int, id_term, id_hup],
            });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered, reload })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns true once per received SIGHUP burst.
    pub fn take_reload_request(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use signal_hook::consts::signal::SIGHUP;
    use signal_hook::low_level::raise;

    use super::ShutdownHooks;

    #[test]
    fn sighup_sets_reload_flag_once() {
        let hooks = ShutdownHooks::install().expect("signal hooks should install");
        assert!(!hooks.take_reload_request());

        raise(SIGHUP).expect("raise SIGHUP");
        assert!(hooks.take_reload_request());
        assert!(!hooks.take_reload_request());
        assert!(!hooks.is_triggered());
    }
}
