// System power notifications via IOKit
//
// IORegisterForSystemPower delivers sleep/wake messages on a CFRunLoop. A
// dedicated thread owns that run loop for the life of the process and turns
// "system has powered on" into an engine Wake event. Sleep requests are
// always acknowledged so the system is never held awake.

use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopAddSource, CFRunLoopGetCurrent, CFRunLoopRun,
    CFRunLoopSourceRef,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::events::EngineEvent;

type IONotificationPortRef = *mut c_void;
type IoObject = u32;
type IoConnect = u32;
type IoService = u32;

type IOServiceInterestCallback = extern "C" fn(
    refcon: *mut c_void,
    service: IoService,
    message_type: u32,
    message_argument: *mut c_void,
);

// IOMessage.h
const IO_MESSAGE_CAN_SYSTEM_SLEEP: u32 = 0xE000_0270;
const IO_MESSAGE_SYSTEM_WILL_SLEEP: u32 = 0xE000_0280;
const IO_MESSAGE_SYSTEM_HAS_POWERED_ON: u32 = 0xE000_0300;

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IORegisterForSystemPower(
        refcon: *mut c_void,
        the_port_ref: *mut IONotificationPortRef,
        callback: IOServiceInterestCallback,
        notifier: *mut IoObject,
    ) -> IoConnect;

    fn IONotificationPortGetRunLoopSource(notify: IONotificationPortRef) -> CFRunLoopSourceRef;

    fn IOAllowPowerChange(kernel_port: IoConnect, notification_id: isize) -> i32;
}

struct PowerContext {
    sender: mpsc::UnboundedSender<EngineEvent>,
    root_port: AtomicU32,
}

pub struct SystemPowerWatcher {
    _thread: JoinHandle<()>,
}

impl SystemPowerWatcher {
    pub fn spawn(sender: mpsc::UnboundedSender<EngineEvent>) -> io::Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("system-power".to_string())
            .spawn(move || run_power_loop(sender, ready_tx))?;

        match ready_rx.recv() {
            Ok(true) => Ok(Self { _thread: thread }),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "IORegisterForSystemPower failed",
            )),
        }
    }
}

fn run_power_loop(sender: mpsc::UnboundedSender<EngineEvent>, ready: std::sync::mpsc::Sender<bool>) {
    // Lives as long as the run loop, i.e. the process
    let context = Box::into_raw(Box::new(PowerContext {
        sender,
        root_port: AtomicU32::new(0),
    }));

    let mut port: IONotificationPortRef = ptr::null_mut();
    let mut notifier: IoObject = 0;
    let root_port = unsafe {
        IORegisterForSystemPower(
            context as *mut c_void,
            &mut port,
            power_callback,
            &mut notifier,
        )
    };

    if root_port == 0 || port.is_null() {
        unsafe { drop(Box::from_raw(context)) };
        let _ = ready.send(false);
        return;
    }

    unsafe {
        (*context).root_port.store(root_port, Ordering::Release);
        CFRunLoopAddSource(
            CFRunLoopGetCurrent(),
            IONotificationPortGetRunLoopSource(port),
            kCFRunLoopDefaultMode,
        );
    }
    let _ = ready.send(true);

    debug!("System power run loop started");
    unsafe { CFRunLoopRun() };
}

extern "C" fn power_callback(
    refcon: *mut c_void,
    _service: IoService,
    message_type: u32,
    message_argument: *mut c_void,
) {
    if refcon.is_null() {
        return;
    }
    let context = unsafe { &*(refcon as *const PowerContext) };

    match message_type {
        IO_MESSAGE_CAN_SYSTEM_SLEEP | IO_MESSAGE_SYSTEM_WILL_SLEEP => {
            let root_port = context.root_port.load(Ordering::Acquire);
            let status = unsafe { IOAllowPowerChange(root_port, message_argument as isize) };
            if status != 0 {
                warn!("IOAllowPowerChange returned {}", status);
            }
        }
        IO_MESSAGE_SYSTEM_HAS_POWERED_ON => {
            debug!("System has powered on");
            if context.sender.send(EngineEvent::Wake).is_err() {
                debug!("Engine gone, dropping wake notification");
            }
        }
        _ => {}
    }
}
