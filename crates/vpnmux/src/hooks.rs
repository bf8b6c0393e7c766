//! Script-backed routing, proxy ACL and DNS hooks
//!
//! Each hook is an external script run to completion through the process
//! runner. A hook left unset in the configuration is logged and skipped.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use vpnmux_tunnel::config::HooksConfig;
use vpnmux_tunnel::{
    CollaboratorError, DeviceId, DnsControl, ProcessRunner, ProfileId, ProxyAcl, RouteHandle,
    Routing, TunnelLink,
};

/// First routing mark handed out to tunnels.
pub const ROUTE_MARK_BASE: u32 = 100;

/// Number of routing slots available.
pub const ROUTE_SLOTS: u32 = 64;

/// Allocator of unique routing marks.
#[derive(Debug)]
pub struct RouteTable {
    base: u32,
    slots: u32,
    in_use: Mutex<BTreeSet<u32>>,
}

impl RouteTable {
    pub fn new(base: u32, slots: u32) -> Self {
        Self {
            base,
            slots,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lowest free mark.
    pub fn acquire(&self) -> Result<RouteHandle, CollaboratorError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let mark = (self.base..self.base + self.slots)
            .find(|mark| !in_use.contains(mark))
            .ok_or(CollaboratorError::RoutesExhausted)?;
        in_use.insert(mark);
        Ok(RouteHandle::new(mark))
    }

    pub fn release(&self, handle: RouteHandle) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.mark());
    }

    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(ROUTE_MARK_BASE, ROUTE_SLOTS)
    }
}

/// Routing, ACL and DNS collaborators backed by configured scripts.
pub struct ScriptHooks {
    runner: Arc<dyn ProcessRunner>,
    hooks: HooksConfig,
    routes: RouteTable,
}

impl ScriptHooks {
    pub fn new(runner: Arc<dyn ProcessRunner>, hooks: HooksConfig) -> Self {
        Self {
            runner,
            hooks,
            routes: RouteTable::default(),
        }
    }

    fn run(&self, hook: &Option<String>, name: &str, args: Vec<String>) -> Result<(), CollaboratorError> {
        match hook {
            Some(script) => {
                debug!("Running {} hook: {} {:?}", name, script, args);
                self.runner.run(script, &args)?;
                Ok(())
            }
            None => {
                debug!("No {} hook configured, skipping {:?}", name, args);
                Ok(())
            }
        }
    }
}

impl Routing for ScriptHooks {
    fn acquire_route(&self) -> Result<RouteHandle, CollaboratorError> {
        self.routes.acquire()
    }

    fn release_route(&self, handle: RouteHandle) {
        let mark = handle.mark();
        self.routes.release(handle);
        debug!("Route {} released ({} in use)", mark, self.routes.in_use());
    }

    fn apply_route(&self, handle: &RouteHandle, link: &TunnelLink) -> Result<(), CollaboratorError> {
        info!("Route {} via {}", handle.mark(), link.interface);
        self.run(
            &self.hooks.route_up,
            "route-up",
            vec![
                "up".to_string(),
                handle.mark().to_string(),
                link.interface.clone(),
                link.vpn_gateway.to_string(),
                link.local_ip.to_string(),
            ],
        )
    }

    fn clear_route(
        &self,
        handle: &RouteHandle,
        trusted_ip: Option<IpAddr>,
    ) -> Result<(), CollaboratorError> {
        self.run(
            &self.hooks.route_down,
            "route-down",
            vec![
                "down".to_string(),
                handle.mark().to_string(),
                trusted_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
            ],
        )
    }

    fn device_routing_changed(&self) {
        if let Err(e) = self.run(&self.hooks.route_up, "route-up", vec!["refresh".to_string()]) {
            warn!("Device routing refresh failed: {}", e);
        }
    }
}

impl ProxyAcl for ScriptHooks {
    fn set_acl_devices(&self, tunnel: &ProfileId, devices: &[DeviceId]) -> Result<(), CollaboratorError> {
        let mut args = vec![tunnel.to_string()];
        args.extend(devices.iter().map(ToString::to_string));
        self.run(&self.hooks.acl, "acl", args)
    }
}

impl DnsControl for ScriptHooks {
    fn use_tunnel_resolver(&self, device: &DeviceId, tunnel: &ProfileId) -> Result<(), CollaboratorError> {
        self.run(
            &self.hooks.dns,
            "dns",
            vec!["resolver".to_string(), device.to_string(), tunnel.to_string()],
        )
    }

    fn use_default_resolver(&self, device: &DeviceId) -> Result<(), CollaboratorError> {
        self.run(
            &self.hooks.dns,
            "dns",
            vec!["default".to_string(), device.to_string()],
        )
    }

    fn add_tunnel_name_servers(
        &self,
        tunnel: &ProfileId,
        servers: &[IpAddr],
        local_ip: IpAddr,
    ) -> Result<(), CollaboratorError> {
        let mut args = vec!["add".to_string(), tunnel.to_string(), local_ip.to_string()];
        args.extend(servers.iter().map(ToString::to_string));
        self.run(&self.hooks.dns, "dns", args)
    }

    fn remove_tunnel_name_servers(&self, tunnel: &ProfileId) -> Result<(), CollaboratorError> {
        self.run(
            &self.hooks.dns,
            "dns",
            vec!["remove".to_string(), tunnel.to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnmux_tunnel::{ProcessError, SpawnedProcess};

    #[derive(Default)]
    struct ScriptLog {
        runs: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl ProcessRunner for ScriptLog {
        fn start(&self, command: &str, _args: &[String]) -> Result<SpawnedProcess, ProcessError> {
            Err(ProcessError::Spawn {
                command: command.to_string(),
                message: "not supported".into(),
            })
        }

        fn run(&self, command: &str, args: &[String]) -> Result<(), ProcessError> {
            self.runs
                .lock()
                .unwrap()
                .push((command.to_string(), args.to_vec()));
            if self.fail {
                Err(ProcessError::Failed {
                    command: command.to_string(),
                    code: Some(1),
                })
            } else {
                Ok(())
            }
        }
    }

    fn hooks() -> HooksConfig {
        HooksConfig {
            route_up: Some("/usr/lib/vpnmux/route".into()),
            route_down: Some("/usr/lib/vpnmux/route".into()),
            acl: Some("/usr/lib/vpnmux/acl".into()),
            dns: None,
        }
    }

    #[test]
    fn test_route_table_reuses_released_marks() {
        let table = RouteTable::new(10, 2);
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        assert_eq!((a.mark(), b.mark()), (10, 11));
        assert_eq!(table.acquire(), Err(CollaboratorError::RoutesExhausted));

        table.release(a);
        assert_eq!(table.acquire().unwrap().mark(), 10);
        assert_eq!(table.in_use(), 2);
    }

    #[test]
    fn test_hook_arguments() {
        let log = Arc::new(ScriptLog::default());
        let scripts = ScriptHooks::new(log.clone(), hooks());
        let tunnel = ProfileId::new("work");

        scripts
            .set_acl_devices(&tunnel, &[DeviceId::new("aa:bb"), DeviceId::new("cc:dd")])
            .unwrap();
        let handle = scripts.acquire_route().unwrap();
        scripts
            .clear_route(&handle, Some("198.51.100.7".parse().unwrap()))
            .unwrap();

        let runs = log.runs.lock().unwrap().clone();
        assert_eq!(
            runs,
            vec![
                (
                    "/usr/lib/vpnmux/acl".to_string(),
                    vec!["work".to_string(), "aa:bb".into(), "cc:dd".into()]
                ),
                (
                    "/usr/lib/vpnmux/route".to_string(),
                    vec!["down".to_string(), ROUTE_MARK_BASE.to_string(), "198.51.100.7".into()]
                ),
            ]
        );
    }

    #[test]
    fn test_missing_hook_is_skipped() {
        let log = Arc::new(ScriptLog::default());
        let scripts = ScriptHooks::new(log.clone(), hooks());
        scripts
            .use_default_resolver(&DeviceId::new("aa:bb"))
            .unwrap();
        assert!(log.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_hook_reported() {
        let log = Arc::new(ScriptLog {
            fail: true,
            ..ScriptLog::default()
        });
        let scripts = ScriptHooks::new(log, hooks());
        let err = scripts
            .set_acl_devices(&ProfileId::new("work"), &[])
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Process(ProcessError::Failed { .. })));
    }
}
