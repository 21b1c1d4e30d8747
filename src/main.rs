//! # mcsync Firmware
//!
//! Every core boots into the same `main`, meets the others at the boot
//! barrier and then starts its own scheduler with the tasks of its role:
//!
//! | Core | Role      | Tasks (priority)                                  |
//! |------|-----------|---------------------------------------------------|
//! | 0    | Network   | `eth_rx` (5), `link` (4), client or server (3)    |
//! | 1    | RateGate  | `rate_producer` (3), `rate_consumer` (2)          |
//! | 2    | Heartbeat | `heartbeat` (1)                                   |
//!
//! The ETH interrupt is routed to core 0 only. On a development host the
//! same binary runs the thread-based simulation instead.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(not(target_os = "none"), not(feature = "std")))]
compile_error!("the host build of the binary needs the `std` feature");

#[cfg(all(not(target_os = "none"), feature = "std"))]
fn main() {
    use mcsync::host::{SimConfig, Simulation};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sim = Simulation::new(SimConfig::default());
    if let Err(err) = sim.run() {
        log::error!("simulation stopped: {}", err);
        std::process::exit(1);
    }
}

#[cfg(target_os = "none")]
mod firmware {
    use core::sync::atomic::{AtomicPtr, Ordering};

    use cortex_m_rt::{entry, exception};
    use panic_halt as _;

    use mcsync::arch::board::GpioLed;
    use mcsync::arch::cortex_m4;
    use mcsync::arch::gmac::{DmaMemory, Gmac, GmacDma, GmacPhy};
    use mcsync::config::{
        HEARTBEAT_PERIOD_MS, LED_ETH_ACTIVITY_PIN, LED_GPIO_BASE, LED_HEARTBEAT_PIN,
        LED_RATE_GATE_PIN, LINK_MONITOR_PERIOD_MS, MAC_ADDRESS, PHY_ADDRESS,
    };
    use mcsync::context::InterruptContext;
    use mcsync::error::fail_stop;
    use mcsync::eth::rx_deferred_task;
    use mcsync::kernel::{self, KernelPort};
    use mcsync::net::link::link_monitor_task;
    use mcsync::net::stack::{InterfaceConfig, NetStack, SharedStack, StackStorage};
    use mcsync::rate_gate::{consumer_task, producer_task, RateGateConfig};
    use mcsync::system::{heartbeat_task, CoreRole, RoleConfig, System};

    type FirmwareStack = SharedStack<'static, Gmac>;
    type TaskEntry = extern "C" fn() -> !;

    static SYSTEM: System = System::new();

    /// Network stack of core 0, published before its tasks are created.
    static NET: AtomicPtr<FirmwareStack> = AtomicPtr::new(core::ptr::null_mut());

    static PHY: GmacPhy = GmacPhy::new(PHY_ADDRESS);
    static ACTIVITY_LED: GpioLed = GpioLed::new(LED_GPIO_BASE, LED_ETH_ACTIVITY_PIN);
    static GATE_LED: GpioLed = GpioLed::new(LED_GPIO_BASE, LED_RATE_GATE_PIN);
    static HEARTBEAT_LED: GpioLed = GpioLed::new(LED_GPIO_BASE, LED_HEARTBEAT_PIN);

    // Same order as `CoreRole::tasks`.
    const NETWORK_ENTRIES: [TaskEntry; 3] = [eth_rx_task, link_task, net_role_task];
    const RATE_GATE_ENTRIES: [TaskEntry; 2] = [rate_producer_task, rate_consumer_task];
    const HEARTBEAT_ENTRIES: [TaskEntry; 1] = [heartbeat_led_task];

    fn entries(role: CoreRole) -> &'static [TaskEntry] {
        match role {
            CoreRole::Network => &NETWORK_ENTRIES,
            CoreRole::RateGate => &RATE_GATE_ENTRIES,
            CoreRole::Heartbeat => &HEARTBEAT_ENTRIES,
            CoreRole::Unused => &[],
        }
    }

    fn net() -> &'static FirmwareStack {
        // Safety: set once from a `singleton!` that is never freed.
        match unsafe { NET.load(Ordering::Acquire).as_ref() } {
            Some(stack) => stack,
            None => fail_stop(&"network stack used before bring-up"),
        }
    }

    #[entry]
    fn main() -> ! {
        let core = kernel::core_id();
        let Ok(role) = SYSTEM.core_entry(core, &KernelPort) else {
            fail_stop(&"boot rendezvous cancelled")
        };
        if let Err(err) = kernel::init() {
            fail_stop(&err);
        }

        // Safety: SysTick, NVIC and SCB are banked per core and each core
        // takes its own set exactly once, here.
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

        match role {
            CoreRole::Network => {
                bring_up_network();
                cortex_m4::enable_eth_irq(&mut peripherals.NVIC);
            }
            CoreRole::Unused => loop {
                cortex_m::asm::wfi();
            },
            CoreRole::RateGate | CoreRole::Heartbeat => {}
        }

        for (config, entry) in role.tasks().iter().zip(entries(role)) {
            if let Err(err) = kernel::create_task(*entry, *config) {
                fail_stop(&err);
            }
        }
        kernel::start(peripherals)
    }

    fn bring_up_network() {
        let Some(dma) = cortex_m::singleton!(: DmaMemory = DmaMemory::new()) else {
            fail_stop(&"ETH DMA memory taken twice")
        };
        let Some(storage) = cortex_m::singleton!(: StackStorage<'static> = StackStorage::new()) else {
            fail_stop(&"socket storage taken twice")
        };
        let stack = NetStack::with_storage(
            Gmac::new(dma, MAC_ADDRESS),
            &InterfaceConfig::default(),
            storage,
            kernel::now_ms(),
        );
        let Some(shared) = cortex_m::singleton!(: FirmwareStack = SharedStack::new(stack)) else {
            fail_stop(&"network stack taken twice")
        };
        NET.store(shared, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    extern "C" fn eth_rx_task() -> ! {
        let ctx = SYSTEM.task_context("eth_rx", &KernelPort);
        let _ = rx_deferred_task(&ctx, &SYSTEM.eth_rx, net());
        kernel::exit_task()
    }

    extern "C" fn link_task() -> ! {
        let ctx = SYSTEM.task_context("link", &KernelPort);
        let _ = link_monitor_task(&ctx, &PHY, net(), LINK_MONITOR_PERIOD_MS);
        kernel::exit_task()
    }

    extern "C" fn net_role_task() -> ! {
        let ctx = SYSTEM.task_context("net_role", &KernelPort);
        if let Err(err) = SYSTEM.run_net_role(&ctx, net(), &RoleConfig::default(), |_| {}) {
            fail_stop(&err);
        }
        kernel::exit_task()
    }

    extern "C" fn rate_producer_task() -> ! {
        let ctx = SYSTEM.task_context("rate_producer", &KernelPort);
        let _ = producer_task(&ctx, &SYSTEM.rate_gate, &RateGateConfig::default(), &SYSTEM.gate_stats);
        kernel::exit_task()
    }

    extern "C" fn rate_consumer_task() -> ! {
        let ctx = SYSTEM.task_context("rate_consumer", &KernelPort);
        let _ = consumer_task(
            &ctx,
            &SYSTEM.rate_gate,
            &RateGateConfig::default(),
            &SYSTEM.gate_stats,
            Some(&GATE_LED),
        );
        kernel::exit_task()
    }

    extern "C" fn heartbeat_led_task() -> ! {
        let ctx = SYSTEM.task_context("heartbeat", &KernelPort);
        let _ = heartbeat_task(&ctx, &HEARTBEAT_LED, HEARTBEAT_PERIOD_MS);
        kernel::exit_task()
    }

    // -----------------------------------------------------------------------
    // Interrupts
    // -----------------------------------------------------------------------

    /// Every device interrupt lands here; only the ETH line is enabled.
    #[exception]
    unsafe fn DefaultHandler(irqn: i16) {
        if cortex_m4::is_eth_irq(irqn) {
            let irq = InterruptContext::new(&KernelPort);
            SYSTEM
                .eth_irq_handler()
                .with_activity_led(&ACTIVITY_LED)
                .on_interrupt(&irq, &GmacDma);
        }
    }
}
