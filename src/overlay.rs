//! "Session controlled by" overlay shown by the capture helper.
//!
//! A topmost, borderless, click-through tool window anchored to the
//! bottom-right of the primary working area. The window lives on its own
//! thread with its own message pump; show/hide requests arrive over a
//! channel. Re-anchoring happens on every show, which keeps the overlay in
//! place across resolution changes.

use crate::bridge::NotifyPayload;
use std::ffi::c_void;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::warn;

const OVERLAY_WIDTH: i32 = 340;
const OVERLAY_HEIGHT: i32 = 34;
const EDGE_MARGIN: i32 = 12;

enum OverlayCmd {
    Show(String),
    Hide,
    Quit,
}

static COMMANDS: OnceLock<Mutex<Sender<OverlayCmd>>> = OnceLock::new();
static CAPTION: Mutex<Vec<u16>> = Mutex::new(Vec::new());

/// Apply an overlay notify frame from the service.
pub fn update(notify: &NotifyPayload) {
    if notify.connected {
        send(OverlayCmd::Show(notify.technician_name.clone()));
    } else {
        send(OverlayCmd::Hide);
    }
}

/// Tear the overlay down on helper exit.
pub fn shutdown() {
    if COMMANDS.get().is_some() {
        send(OverlayCmd::Quit);
    }
}

fn send(command: OverlayCmd) {
    let sender = COMMANDS.get_or_init(|| {
        let (tx, rx) = mpsc::channel();
        if let Err(e) = std::thread::Builder::new()
            .name("overlay".to_string())
            .spawn(move || window_thread(rx))
        {
            warn!("overlay thread failed to start: {e}");
        }
        Mutex::new(tx)
    });
    if let Ok(sender) = sender.lock() {
        let _ = sender.send(command);
    }
}

fn set_caption(name: &str) {
    use std::os::windows::ffi::OsStrExt;
    let text = format!("Session controlled by: {name}");
    let wide: Vec<u16> = std::ffi::OsStr::new(&text)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    if let Ok(mut caption) = CAPTION.lock() {
        *caption = wide;
    }
}

type Hwnd = *mut c_void;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Rect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

#[repr(C)]
struct Msg {
    hwnd: Hwnd,
    message: u32,
    wparam: usize,
    lparam: isize,
    time: u32,
    pt: Point,
}

#[repr(C)]
struct PaintStruct {
    hdc: *mut c_void,
    erase: i32,
    rc_paint: Rect,
    restore: i32,
    inc_update: i32,
    rgb_reserved: [u8; 32],
}

#[repr(C)]
struct WndClassW {
    style: u32,
    wnd_proc: unsafe extern "system" fn(Hwnd, u32, usize, isize) -> isize,
    cls_extra: i32,
    wnd_extra: i32,
    instance: *mut c_void,
    icon: *mut c_void,
    cursor: *mut c_void,
    background: *mut c_void,
    menu_name: *const u16,
    class_name: *const u16,
}

#[link(name = "user32")]
extern "system" {
    fn RegisterClassW(class: *const WndClassW) -> u16;
    fn CreateWindowExW(
        ex_style: u32,
        class_name: *const u16,
        window_name: *const u16,
        style: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        parent: Hwnd,
        menu: *mut c_void,
        instance: *mut c_void,
        param: *mut c_void,
    ) -> Hwnd;
    fn DefWindowProcW(hwnd: Hwnd, message: u32, wparam: usize, lparam: isize) -> isize;
    fn DestroyWindow(hwnd: Hwnd) -> i32;
    fn ShowWindow(hwnd: Hwnd, cmd: i32) -> i32;
    fn SetWindowPos(
        hwnd: Hwnd,
        insert_after: Hwnd,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        flags: u32,
    ) -> i32;
    fn SetLayeredWindowAttributes(hwnd: Hwnd, key: u32, alpha: u8, flags: u32) -> i32;
    fn SystemParametersInfoW(action: u32, param: u32, pv_param: *mut c_void, win_ini: u32) -> i32;
    fn PeekMessageW(msg: *mut Msg, hwnd: Hwnd, min: u32, max: u32, remove: u32) -> i32;
    fn TranslateMessage(msg: *const Msg) -> i32;
    fn DispatchMessageW(msg: *const Msg) -> isize;
    fn InvalidateRect(hwnd: Hwnd, rect: *const Rect, erase: i32) -> i32;
    fn BeginPaint(hwnd: Hwnd, paint: *mut PaintStruct) -> *mut c_void;
    fn EndPaint(hwnd: Hwnd, paint: *const PaintStruct) -> i32;
    fn GetClientRect(hwnd: Hwnd, rect: *mut Rect) -> i32;
    fn FillRect(hdc: *mut c_void, rect: *const Rect, brush: *mut c_void) -> i32;
    fn DrawTextW(hdc: *mut c_void, text: *const u16, count: i32, rect: *mut Rect, format: u32) -> i32;
}

#[link(name = "gdi32")]
extern "system" {
    fn CreateSolidBrush(color: u32) -> *mut c_void;
    fn DeleteObject(object: *mut c_void) -> i32;
    fn SetBkMode(hdc: *mut c_void, mode: i32) -> i32;
    fn SetTextColor(hdc: *mut c_void, color: u32) -> u32;
}

#[link(name = "kernel32")]
extern "system" {
    fn GetModuleHandleW(name: *const u16) -> *mut c_void;
}

const WS_EX_TOPMOST: u32 = 0x0000_0008;
const WS_EX_TOOLWINDOW: u32 = 0x0000_0080;
const WS_EX_TRANSPARENT: u32 = 0x0000_0020;
const WS_EX_LAYERED: u32 = 0x0008_0000;
const WS_EX_NOACTIVATE: u32 = 0x0800_0000;
const WS_POPUP: u32 = 0x8000_0000;
const SW_HIDE: i32 = 0;
const LWA_ALPHA: u32 = 0x0000_0002;
const SPI_GETWORKAREA: u32 = 0x0030;
const PM_REMOVE: u32 = 0x0001;
const WM_PAINT: u32 = 0x000F;
const SWP_NOACTIVATE: u32 = 0x0010;
const SWP_SHOWWINDOW: u32 = 0x0040;
const HWND_TOPMOST: isize = -1;
const DT_CENTER: u32 = 0x0001;
const DT_VCENTER: u32 = 0x0004;
const DT_SINGLELINE: u32 = 0x0020;
const BK_TRANSPARENT: i32 = 1;
const BACKGROUND_COLOR: u32 = 0x0028_1E14; // BGR: dark slate
const TEXT_COLOR: u32 = 0x00FF_FFFF;

unsafe extern "system" fn overlay_proc(hwnd: Hwnd, message: u32, wparam: usize, lparam: isize) -> isize {
    if message == WM_PAINT {
        paint(hwnd);
        return 0;
    }
    DefWindowProcW(hwnd, message, wparam, lparam)
}

unsafe fn paint(hwnd: Hwnd) {
    let mut ps: PaintStruct = std::mem::zeroed();
    let hdc = BeginPaint(hwnd, &mut ps);
    if hdc.is_null() {
        return;
    }

    let mut rect = Rect::default();
    GetClientRect(hwnd, &mut rect);

    let brush = CreateSolidBrush(BACKGROUND_COLOR);
    FillRect(hdc, &rect, brush);
    DeleteObject(brush);

    SetBkMode(hdc, BK_TRANSPARENT);
    SetTextColor(hdc, TEXT_COLOR);
    if let Ok(caption) = CAPTION.lock() {
        if !caption.is_empty() {
            DrawTextW(
                hdc,
                caption.as_ptr(),
                caption.len() as i32 - 1,
                &mut rect,
                DT_CENTER | DT_VCENTER | DT_SINGLELINE,
            );
        }
    }
    EndPaint(hwnd, &ps);
}

/// Anchor to the bottom-right of the current working area and show without
/// stealing focus.
unsafe fn anchor_and_show(hwnd: Hwnd) {
    let mut work_area = Rect::default();
    SystemParametersInfoW(
        SPI_GETWORKAREA,
        0,
        &mut work_area as *mut Rect as *mut c_void,
        0,
    );
    let x = work_area.right - OVERLAY_WIDTH - EDGE_MARGIN;
    let y = work_area.bottom - OVERLAY_HEIGHT - EDGE_MARGIN;
    SetWindowPos(
        hwnd,
        HWND_TOPMOST as Hwnd,
        x,
        y,
        OVERLAY_WIDTH,
        OVERLAY_HEIGHT,
        SWP_NOACTIVATE | SWP_SHOWWINDOW,
    );
    InvalidateRect(hwnd, std::ptr::null(), 1);
}

fn window_thread(commands: Receiver<OverlayCmd>) {
    use std::os::windows::ffi::OsStrExt;

    let class_name: Vec<u16> = std::ffi::OsStr::new("HostlinkOverlay")
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let instance = GetModuleHandleW(std::ptr::null());
        let class = WndClassW {
            style: 0,
            wnd_proc: overlay_proc,
            cls_extra: 0,
            wnd_extra: 0,
            instance,
            icon: std::ptr::null_mut(),
            cursor: std::ptr::null_mut(),
            background: std::ptr::null_mut(),
            menu_name: std::ptr::null(),
            class_name: class_name.as_ptr(),
        };
        if RegisterClassW(&class) == 0 {
            warn!("overlay window class registration failed");
            return;
        }

        let hwnd = CreateWindowExW(
            WS_EX_TOPMOST | WS_EX_TOOLWINDOW | WS_EX_TRANSPARENT | WS_EX_LAYERED
                | WS_EX_NOACTIVATE,
            class_name.as_ptr(),
            std::ptr::null(),
            WS_POPUP,
            0,
            0,
            OVERLAY_WIDTH,
            OVERLAY_HEIGHT,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            instance,
            std::ptr::null_mut(),
        );
        if hwnd.is_null() {
            warn!("overlay window creation failed");
            return;
        }
        SetLayeredWindowAttributes(hwnd, 0, 230, LWA_ALPHA);

        loop {
            let mut msg: Msg = std::mem::zeroed();
            while PeekMessageW(&mut msg, std::ptr::null_mut(), 0, 0, PM_REMOVE) != 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }

            match commands.recv_timeout(Duration::from_millis(25)) {
                Ok(OverlayCmd::Show(name)) => {
                    set_caption(&name);
                    anchor_and_show(hwnd);
                }
                Ok(OverlayCmd::Hide) => {
                    ShowWindow(hwnd, SW_HIDE);
                }
                Ok(OverlayCmd::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        DestroyWindow(hwnd);
    }
}
