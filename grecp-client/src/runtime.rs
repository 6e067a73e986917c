use anyhow::Result;
use grecp_core::config::ClientConfig;
use tokio::sync::watch;

/// Run the client until `stop` flips to true or a termination signal arrives
pub async fn run_client(cfg: ClientConfig, stop: watch::Receiver<bool>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::run(cfg, stop).await
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (cfg, stop);
        anyhow::bail!("grecp-client currently only supports Linux");
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use anyhow::{Context, Result};
    use grecp_core::bridge::{Decapsulator, Encapsulator, REORDER_POLL_INTERVAL};
    use grecp_core::config::ClientConfig;
    use grecp_core::control_loop::{Controller, LinkEndpoint};
    use grecp_core::dhcp::{DhcpScript, Family, UdhcpcHelper};
    use grecp_core::event::ScriptNotifier;
    use grecp_core::proto::TunnelType;
    use grecp_core::reorder::ReorderPolicy;
    use grecp_core::session::LinkView;
    use grecp_core::transport::{
        demultiplex, is_interface_name, resolve_interface_ipv6, GreSocket, NetworkDevice, Plane,
        DEFAULT_READ_TIMEOUT,
    };
    use grecp_core::tun::{LinuxTunDevice, PacketInfo, TunnelLifecycle, TunnelParams};
    use std::io;
    use std::net::Ipv6Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::mpsc::{self, error::TrySendError};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::MissedTickBehavior;

    const RECV_BUF_SIZE: usize = 2048;
    const CONTROL_QUEUE: usize = 64;
    const DATA_QUEUE: usize = 1024;

    type DeviceSlot = Option<Arc<LinuxTunDevice>>;

    /// Open the raw GRE socket of one link
    fn open_link(tunnel: TunnelType, interface: &str) -> Result<Arc<GreSocket>> {
        let local = resolve_interface_ipv6(interface).with_context(|| {
            format!("failed to resolve IPv6 address of {tunnel} interface '{interface}'")
        })?;
        let device = is_interface_name(interface).then_some(interface);
        let socket = GreSocket::open(local, device, DEFAULT_READ_TIMEOUT)
            .with_context(|| format!("failed to open raw GRE socket for {tunnel} on {local}"))?;
        tracing::info!("{tunnel} tunnel endpoint {local} ({interface})");
        Ok(Arc::new(socket))
    }

    /// TUN device plus the egress task feeding it into the links
    struct TunBridge {
        devices: watch::Sender<DeviceSlot>,
        views: watch::Receiver<LinkView>,
        lte: Arc<GreSocket>,
        dsl: Option<Arc<GreSocket>>,
        egress: Option<JoinHandle<()>>,
    }

    impl TunnelLifecycle for TunBridge {
        fn create(&mut self, params: &TunnelParams) -> io::Result<()> {
            let device = Arc::new(LinuxTunDevice::create(params)?);
            self.egress = Some(tokio::spawn(run_egress(
                device.clone(),
                self.views.clone(),
                self.lte.clone(),
                self.dsl.clone(),
            )));
            self.devices.send_replace(Some(device));
            Ok(())
        }

        fn destroy(&mut self) -> io::Result<()> {
            if let Some(egress) = self.egress.take() {
                egress.abort();
            }
            self.devices.send_replace(None);
            Ok(())
        }
    }

    async fn run_egress(
        device: Arc<LinuxTunDevice>,
        views: watch::Receiver<LinkView>,
        lte: Arc<GreSocket>,
        dsl: Option<Arc<GreSocket>>,
    ) {
        let mut encapsulator = Encapsulator::new();
        let mut buf = vec![0u8; usize::from(device.mtu()) + PacketInfo::SIZE];

        loop {
            let len = match device.recv_frame(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    tracing::error!("Reading from tunnel interface failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let view = *views.borrow();
            let Some((tunnel, packet)) = encapsulator.encapsulate(&buf[..len], &view) else {
                continue;
            };
            let socket = match tunnel {
                TunnelType::Lte => &lte,
                TunnelType::Dsl => match &dsl {
                    Some(dsl) => dsl,
                    None => {
                        tracing::error!("No socket for DSL tunnel");
                        continue;
                    }
                },
            };
            if let Err(e) = socket.send(&packet, view.haap_ip) {
                tracing::error!("Sending data packet via {tunnel} failed: {e}");
            }
        }
    }

    async fn run_ingress(
        mut packets: mpsc::Receiver<Vec<u8>>,
        views: watch::Receiver<LinkView>,
        mut devices: watch::Receiver<DeviceSlot>,
        policy: ReorderPolicy,
    ) {
        let mut decapsulator = Decapsulator::new(policy);
        let mut device = devices.borrow_and_update().clone();
        let mut poll = tokio::time::interval(REORDER_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let frames = tokio::select! {
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        let view = *views.borrow();
                        decapsulator.on_packet(&packet, &view, Instant::now())
                    }
                    None => break,
                },
                _ = poll.tick() => {
                    let view = *views.borrow();
                    decapsulator.on_tick(&view, Instant::now())
                }
                changed = devices.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // A new device starts a new sequence space
                    device = devices.borrow_and_update().clone();
                    decapsulator.reset();
                    continue;
                }
            };

            let Some(tun) = &device else {
                if !frames.is_empty() {
                    tracing::trace!("No tunnel interface, dropping {} frame(s)", frames.len());
                }
                continue;
            };
            for frame in frames {
                if let Err(e) = tun.send_frame(&frame).await {
                    tracing::error!("Writing to tunnel interface failed: {e}");
                }
            }
        }
    }

    /// Blocking receive loop of one link socket
    fn spawn_receiver(
        tunnel: TunnelType,
        socket: Arc<GreSocket>,
        views: watch::Receiver<LinkView>,
        control: mpsc::Sender<(Vec<u8>, Ipv6Addr)>,
        data: mpsc::Sender<Vec<u8>>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("grecp-rx-{}", tunnel.to_string().to_lowercase()))
            .spawn(move || {
                let mut buf = vec![0u8; RECV_BUF_SIZE];
                while !stop.load(Ordering::Relaxed) {
                    let (len, source) = match socket.receive(&mut buf) {
                        Ok(Some(received)) => received,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!("Receiving on {tunnel} socket failed: {e}");
                            thread::sleep(Duration::from_secs(1));
                            continue;
                        }
                    };

                    let packet = &buf[..len];
                    let haap_ip = views.borrow().haap_ip;
                    match demultiplex(packet, source, haap_ip) {
                        Some(Plane::Control) => {
                            if control.blocking_send((packet.to_vec(), source)).is_err() {
                                return;
                            }
                        }
                        Some(Plane::Data) => match data.try_send(packet.to_vec()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                tracing::trace!("Ingress queue full, dropping packet from {tunnel}");
                            }
                            Err(TrySendError::Closed(_)) => return,
                        },
                        None => {}
                    }
                }
            })
    }

    pub async fn run(cfg: ClientConfig, mut stop: watch::Receiver<bool>) -> Result<()> {
        let origin = Instant::now();
        let uptime = move || origin.elapsed();

        tracing::info!(
            "Client config: anycast={} lte={} dsl={} bonding={} tunnel={} mtu={}",
            cfg.haap_anycast_ip,
            cfg.lte_interface,
            cfg.dsl_interface,
            cfg.bonding,
            cfg.tunnel_interface_name,
            cfg.effective_mtu()
        );

        let lte = open_link(TunnelType::Lte, &cfg.lte_interface)?;
        let dsl = if cfg.bonding {
            Some(open_link(TunnelType::Dsl, &cfg.dsl_interface)?)
        } else {
            None
        };

        let (views_tx, views_rx) = watch::channel(LinkView::default());
        let (devices_tx, devices_rx) = watch::channel::<DeviceSlot>(None);

        let bridge = TunBridge {
            devices: devices_tx,
            views: views_rx.clone(),
            lte: lte.clone(),
            dsl: dsl.clone(),
            egress: None,
        };
        let notifier = ScriptNotifier::new(cfg.event_script_path.clone());

        let mut controller = Controller::new(
            &cfg,
            LinkEndpoint::new(lte.clone(), lte.local_addr()),
            dsl.as_ref()
                .map(|dsl| LinkEndpoint::new(dsl.clone(), dsl.local_addr())),
            Box::new(bridge),
            Box::new(notifier),
        );

        // Removed again when the controller (and its helpers) are gone
        let script = if cfg.dhcp.ipv4 || cfg.dhcp.ipv6 {
            Some(DhcpScript::create().context("failed to write DHCP helper script")?)
        } else {
            None
        };
        if let Some(script) = &script {
            let verbose = matches!(cfg.log_level.as_str(), "debug" | "trace");
            for (enabled, family) in [(cfg.dhcp.ipv4, Family::Ipv4), (cfg.dhcp.ipv6, Family::Ipv6)] {
                if enabled {
                    let helper = UdhcpcHelper::new(family, &cfg.dhcp.busybox_path, script.path())
                        .verbose(verbose);
                    controller = controller.with_dhcp(Box::new(helper));
                }
            }
        }
        views_tx.send_replace(controller.view());

        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
        let receivers_stop = Arc::new(AtomicBool::new(false));

        let mut receivers = Vec::new();
        for (tunnel, socket) in [(TunnelType::Lte, Some(&lte)), (TunnelType::Dsl, dsl.as_ref())] {
            let Some(socket) = socket else {
                continue;
            };
            let handle = spawn_receiver(
                tunnel,
                socket.clone(),
                views_rx.clone(),
                control_tx.clone(),
                data_tx.clone(),
                receivers_stop.clone(),
            )
            .with_context(|| format!("failed to start {tunnel} receive thread"))?;
            receivers.push(handle);
        }
        drop(data_tx);

        let ingress = tokio::spawn(run_ingress(
            data_rx,
            views_rx.clone(),
            devices_rx,
            cfg.reorder,
        ));

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut tick = tokio::time::interval(cfg.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        controller.startup();
        tracing::info!("grecp-client started");

        let mut stopping = false;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let flow = controller.tick(uptime());
                    views_tx.send_replace(controller.view());
                    if flow.is_break() {
                        break;
                    }
                }
                Some((packet, source)) = control_rx.recv() => {
                    controller.handle_packet(&packet, source, uptime());
                    views_tx.send_replace(controller.view());
                }
                changed = stop.changed(), if !stopping => {
                    if changed.is_err() || *stop.borrow() {
                        tracing::info!("Stop requested");
                        stopping = true;
                        controller.request_shutdown();
                    }
                }
                _ = tokio::signal::ctrl_c(), if !stopping => {
                    tracing::info!("Shutdown signal received");
                    stopping = true;
                    controller.request_shutdown();
                }
                _ = sigterm.recv(), if !stopping => {
                    tracing::info!("Shutdown signal received");
                    stopping = true;
                    controller.request_shutdown();
                }
            }
        }

        receivers_stop.store(true, Ordering::Relaxed);
        ingress.abort();
        drop(controller);
        drop(script);

        tokio::task::spawn_blocking(move || {
            for receiver in receivers {
                if receiver.join().is_err() {
                    tracing::warn!("Receive thread panicked");
                }
            }
        })
        .await
        .context("failed to join receive threads")?;

        tracing::info!("grecp-client stopped");
        Ok(())
    }
}
