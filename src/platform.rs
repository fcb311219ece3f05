//! Platform integration for hostlink.
//!
//! Everything the agent needs from the OS lives here: the per-machine data
//! directory, host identity strings, CPU/memory counters, desktop and
//! session queries, input injection, and the session-0 process plumbing.
//! Windows support is first-class; other platforms get conservative
//! fallbacks so the agent still connects and heartbeats.

use std::path::PathBuf;

#[cfg(windows)]
use std::ffi::c_void;

/// Per-machine data directory holding the configuration override and logs.
///
/// - Windows: `%ProgramData%\hostlink`
/// - Linux/BSD: `/etc/hostlink`
/// - elsewhere: the local data dir reported by `dirs-next`
pub fn data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(program_data) = std::env::var("ProgramData") {
            return PathBuf::from(program_data).join("hostlink");
        }
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        return PathBuf::from("/etc/hostlink");
    }
    #[allow(unreachable_code)]
    dirs_next::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostlink")
}

/// Machine name reported in the AUTH payload.
pub fn hostname() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
    }
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(any(unix, windows)))]
    {
        "unknown".to_string()
    }
}

/// Human-readable OS description reported in the AUTH payload.
#[cfg(windows)]
pub fn os_description() -> String {
    #[repr(C)]
    struct OsVersionInfoW {
        size: u32,
        major: u32,
        minor: u32,
        build: u32,
        platform: u32,
        csd: [u16; 128],
    }

    // RtlGetVersion is not subject to the manifest-based version lie that
    // GetVersionEx is.
    #[link(name = "ntdll")]
    extern "system" {
        fn RtlGetVersion(info: *mut OsVersionInfoW) -> i32;
    }

    let mut info: OsVersionInfoW = unsafe { std::mem::zeroed() };
    info.size = std::mem::size_of::<OsVersionInfoW>() as u32;
    if unsafe { RtlGetVersion(&mut info) } == 0 {
        format!(
            "Windows {}.{}.{} {}",
            info.major,
            info.minor,
            info.build,
            std::env::consts::ARCH
        )
    } else {
        format!("windows {}", std::env::consts::ARCH)
    }
}

#[cfg(not(windows))]
pub fn os_description() -> String {
    let read = |path: &str| {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    match (
        read("/proc/sys/kernel/ostype"),
        read("/proc/sys/kernel/osrelease"),
    ) {
        (Some(ostype), Some(release)) => {
            format!("{} {} {}", ostype, release, std::env::consts::ARCH)
        }
        _ => format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

/// Whole-system CPU counters. `total` includes `idle`; load is computed
/// from the delta between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

#[cfg(windows)]
pub fn cpu_times() -> Option<CpuTimes> {
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct FileTime {
        low: u32,
        high: u32,
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn GetSystemTimes(
            idle: *mut FileTime,
            kernel: *mut FileTime,
            user: *mut FileTime,
        ) -> i32;
    }

    fn ticks(ft: FileTime) -> u64 {
        ((ft.high as u64) << 32) | ft.low as u64
    }

    let mut idle = FileTime::default();
    let mut kernel = FileTime::default();
    let mut user = FileTime::default();
    if unsafe { GetSystemTimes(&mut idle, &mut kernel, &mut user) } == 0 {
        return None;
    }
    // Kernel time already includes idle time.
    Some(CpuTimes {
        idle: ticks(idle),
        total: ticks(kernel) + ticks(user),
    })
}

#[cfg(unix)]
pub fn cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

#[cfg(not(any(unix, windows)))]
pub fn cpu_times() -> Option<CpuTimes> {
    None
}

/// Whole-system memory load in percent.
#[cfg(windows)]
pub fn memory_percent() -> Option<f32> {
    #[repr(C)]
    struct MemoryStatusEx {
        length: u32,
        memory_load: u32,
        total_phys: u64,
        avail_phys: u64,
        total_page_file: u64,
        avail_page_file: u64,
        total_virtual: u64,
        avail_virtual: u64,
        avail_extended_virtual: u64,
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn GlobalMemoryStatusEx(buffer: *mut MemoryStatusEx) -> i32;
    }

    let mut status: MemoryStatusEx = unsafe { std::mem::zeroed() };
    status.length = std::mem::size_of::<MemoryStatusEx>() as u32;
    if unsafe { GlobalMemoryStatusEx(&mut status) } == 0 {
        return None;
    }
    Some(status.memory_load as f32)
}

#[cfg(unix)]
pub fn memory_percent() -> Option<f32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let read_kb = |key: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = read_kb("MemTotal:")?;
    let available = read_kb("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((1.0 - available as f32 / total as f32) * 100.0)
}

#[cfg(not(any(unix, windows)))]
pub fn memory_percent() -> Option<f32> {
    None
}

/// Whether the process runs in the non-interactive service session
/// (session 0), in which case screen and input access must go through the
/// in-session helper.
#[cfg(windows)]
pub fn in_service_session() -> bool {
    #[link(name = "kernel32")]
    extern "system" {
        fn GetCurrentProcessId() -> u32;
        fn ProcessIdToSessionId(pid: u32, session: *mut u32) -> i32;
    }

    let mut session = 0u32;
    unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) != 0 && session == 0 }
}

#[cfg(not(windows))]
pub fn in_service_session() -> bool {
    false
}

/// Pixel dimensions of the primary display.
#[cfg(windows)]
pub fn primary_screen_size() -> Option<(i32, i32)> {
    const SM_CXSCREEN: i32 = 0;
    const SM_CYSCREEN: i32 = 1;

    #[link(name = "user32")]
    extern "system" {
        fn GetSystemMetrics(index: i32) -> i32;
    }

    let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
    (w > 0 && h > 0).then_some((w, h))
}

#[cfg(not(windows))]
pub fn primary_screen_size() -> Option<(i32, i32)> {
    None
}

/// Inject a batch of abstract input ops at the OS level.
#[cfg(windows)]
pub fn inject(ops: &[crate::input::InputOp]) -> Result<(), crate::input::InputError> {
    use crate::input::{Button, InputError, InputOp};

    const INPUT_MOUSE: u32 = 0;
    const INPUT_KEYBOARD: u32 = 1;
    const MOUSEEVENTF_MOVE: u32 = 0x0001;
    const MOUSEEVENTF_ABSOLUTE: u32 = 0x8000;
    const MOUSEEVENTF_LEFTDOWN: u32 = 0x0002;
    const MOUSEEVENTF_LEFTUP: u32 = 0x0004;
    const MOUSEEVENTF_RIGHTDOWN: u32 = 0x0008;
    const MOUSEEVENTF_RIGHTUP: u32 = 0x0010;
    const MOUSEEVENTF_MIDDLEDOWN: u32 = 0x0020;
    const MOUSEEVENTF_MIDDLEUP: u32 = 0x0040;
    const KEYEVENTF_KEYUP: u32 = 0x0002;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct MouseInput {
        dx: i32,
        dy: i32,
        mouse_data: u32,
        flags: u32,
        time: u32,
        extra_info: usize,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct KeybdInput {
        vk: u16,
        scan: u16,
        flags: u32,
        time: u32,
        extra_info: usize,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    union InputUnion {
        mi: MouseInput,
        ki: KeybdInput,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Input {
        kind: u32,
        u: InputUnion,
    }

    #[link(name = "user32")]
    extern "system" {
        fn SendInput(count: u32, inputs: *const Input, size: i32) -> u32;
    }

    fn mouse(dx: i32, dy: i32, flags: u32) -> Input {
        Input {
            kind: INPUT_MOUSE,
            u: InputUnion {
                mi: MouseInput {
                    dx,
                    dy,
                    mouse_data: 0,
                    flags,
                    time: 0,
                    extra_info: 0,
                },
            },
        }
    }

    fn key(vk: u16, flags: u32) -> Input {
        Input {
            kind: INPUT_KEYBOARD,
            u: InputUnion {
                ki: KeybdInput {
                    vk,
                    scan: 0,
                    flags,
                    time: 0,
                    extra_info: 0,
                },
            },
        }
    }

    let inputs: Vec<Input> = ops
        .iter()
        .map(|op| match *op {
            InputOp::MouseMove { nx, ny } => mouse(
                nx as i32,
                ny as i32,
                MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE,
            ),
            InputOp::MouseButton { button, down } => {
                let flags = match (button, down) {
                    (Button::Left, true) => MOUSEEVENTF_LEFTDOWN,
                    (Button::Left, false) => MOUSEEVENTF_LEFTUP,
                    (Button::Middle, true) => MOUSEEVENTF_MIDDLEDOWN,
                    (Button::Middle, false) => MOUSEEVENTF_MIDDLEUP,
                    (Button::Right, true) => MOUSEEVENTF_RIGHTDOWN,
                    (Button::Right, false) => MOUSEEVENTF_RIGHTUP,
                };
                mouse(0, 0, flags)
            }
            InputOp::Key { vk, down } => key(vk, if down { 0 } else { KEYEVENTF_KEYUP }),
        })
        .collect();

    if inputs.is_empty() {
        return Ok(());
    }

    let sent = unsafe {
        SendInput(
            inputs.len() as u32,
            inputs.as_ptr(),
            std::mem::size_of::<Input>() as i32,
        )
    };
    if sent as usize != inputs.len() {
        return Err(InputError::Inject(format!(
            "SendInput injected {} of {} events",
            sent,
            inputs.len()
        )));
    }
    Ok(())
}

#[cfg(not(windows))]
pub fn inject(ops: &[crate::input::InputOp]) -> Result<(), crate::input::InputError> {
    tracing::warn!("dropping {} input op(s): injection unsupported here", ops.len());
    Err(crate::input::InputError::Unsupported)
}

/// Check whether a session has an associated user token.
#[cfg(windows)]
fn session_has_user(session_id: u32) -> bool {
    #[link(name = "wtsapi32")]
    extern "system" {
        fn WTSQueryUserToken(session_id: u32, token: *mut *mut c_void) -> i32;
    }
    #[link(name = "kernel32")]
    extern "system" {
        fn CloseHandle(handle: *mut c_void) -> i32;
    }

    let mut token: *mut c_void = std::ptr::null_mut();
    if unsafe { WTSQueryUserToken(session_id, &mut token) } == 0 {
        return false;
    }
    unsafe { CloseHandle(token) };
    true
}

/// Resolve the session the capture helper should run in: the physical
/// console if it has a logged-on user, otherwise the first Active session
/// with a user token.
#[cfg(windows)]
pub fn resolve_interactive_session() -> Option<u32> {
    #[repr(C)]
    struct WtsSessionInfoW {
        session_id: u32,
        win_station_name: *mut u16,
        state: u32,
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn WTSGetActiveConsoleSessionId() -> u32;
    }
    #[link(name = "wtsapi32")]
    extern "system" {
        fn WTSEnumerateSessionsW(
            server: *mut c_void,
            reserved: u32,
            version: u32,
            session_info: *mut *mut WtsSessionInfoW,
            count: *mut u32,
        ) -> i32;
        fn WTSFreeMemory(memory: *mut c_void);
    }

    const WTS_ACTIVE: u32 = 0;
    const INVALID_SESSION: u32 = 0xFFFF_FFFF;

    let console = unsafe { WTSGetActiveConsoleSessionId() };
    if console != INVALID_SESSION && session_has_user(console) {
        return Some(console);
    }

    let mut info: *mut WtsSessionInfoW = std::ptr::null_mut();
    let mut count = 0u32;
    if unsafe { WTSEnumerateSessionsW(std::ptr::null_mut(), 0, 1, &mut info, &mut count) } == 0 {
        return None;
    }
    let sessions = unsafe { std::slice::from_raw_parts(info, count as usize) };
    let found = sessions
        .iter()
        .find(|s| s.state == WTS_ACTIVE && session_has_user(s.session_id))
        .map(|s| s.session_id);
    unsafe { WTSFreeMemory(info as *mut c_void) };
    found
}

#[cfg(not(windows))]
pub fn resolve_interactive_session() -> Option<u32> {
    None
}

/// Security attributes for the bridge pipes: read/write for authenticated
/// users, full control for SYSTEM. Frees the descriptor on drop.
#[cfg(windows)]
pub struct PipeSecurity {
    attributes: Box<SecurityAttributes>,
    descriptor: *mut c_void,
}

#[cfg(windows)]
#[repr(C)]
pub struct SecurityAttributes {
    length: u32,
    descriptor: *mut c_void,
    inherit_handle: i32,
}

#[cfg(windows)]
impl PipeSecurity {
    const SDDL: &'static str = "D:(A;;GRGW;;;AU)(A;;FA;;;SY)";

    pub fn interactive() -> std::io::Result<PipeSecurity> {
        use std::os::windows::ffi::OsStrExt;

        #[link(name = "advapi32")]
        extern "system" {
            fn ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl: *const u16,
                revision: u32,
                descriptor: *mut *mut c_void,
                size: *mut u32,
            ) -> i32;
        }

        const SDDL_REVISION_1: u32 = 1;

        let sddl: Vec<u16> = std::ffi::OsStr::new(Self::SDDL)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let mut descriptor: *mut c_void = std::ptr::null_mut();
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(PipeSecurity {
            attributes: Box::new(SecurityAttributes {
                length: std::mem::size_of::<SecurityAttributes>() as u32,
                descriptor,
                inherit_handle: 0,
            }),
            descriptor,
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        &*self.attributes as *const SecurityAttributes as *mut c_void
    }
}

#[cfg(windows)]
impl Drop for PipeSecurity {
    fn drop(&mut self) {
        #[link(name = "kernel32")]
        extern "system" {
            fn LocalFree(memory: *mut c_void) -> *mut c_void;
        }
        unsafe { LocalFree(self.descriptor) };
    }
}

/// Spawn this executable as the capture helper inside the given session,
/// attached to the default interactive desktop. All duplicated tokens and
/// the environment block are released on every exit path via drop guards.
#[cfg(windows)]
pub fn spawn_helper_in_session(
    session_id: u32,
    capture_pipe: &str,
    input_pipe: &str,
) -> std::io::Result<()> {
    use std::os::windows::ffi::OsStrExt;

    type Handle = *mut c_void;

    #[repr(C)]
    struct StartupInfoW {
        cb: u32,
        reserved: *mut u16,
        desktop: *mut u16,
        title: *mut u16,
        x: u32,
        y: u32,
        x_size: u32,
        y_size: u32,
        x_count_chars: u32,
        y_count_chars: u32,
        fill_attribute: u32,
        flags: u32,
        show_window: u16,
        cb_reserved2: u16,
        lp_reserved2: *mut u8,
        std_input: Handle,
        std_output: Handle,
        std_error: Handle,
    }

    #[repr(C)]
    struct ProcessInformation {
        process: Handle,
        thread: Handle,
        process_id: u32,
        thread_id: u32,
    }

    #[link(name = "wtsapi32")]
    extern "system" {
        fn WTSQueryUserToken(session_id: u32, token: *mut Handle) -> i32;
    }
    #[link(name = "advapi32")]
    extern "system" {
        fn DuplicateTokenEx(
            existing: Handle,
            desired_access: u32,
            attributes: *mut c_void,
            impersonation_level: u32,
            token_type: u32,
            new_token: *mut Handle,
        ) -> i32;
        fn CreateProcessAsUserW(
            token: Handle,
            application_name: *const u16,
            command_line: *mut u16,
            process_attributes: *mut c_void,
            thread_attributes: *mut c_void,
            inherit_handles: i32,
            creation_flags: u32,
            environment: *mut c_void,
            current_directory: *const u16,
            startup_info: *const StartupInfoW,
            process_info: *mut ProcessInformation,
        ) -> i32;
    }
    #[link(name = "userenv")]
    extern "system" {
        fn CreateEnvironmentBlock(
            environment: *mut *mut c_void,
            token: Handle,
            inherit: i32,
        ) -> i32;
    }

    struct OwnedHandle(Handle);
    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            #[link(name = "kernel32")]
            extern "system" {
                fn CloseHandle(handle: *mut c_void) -> i32;
            }
            unsafe { CloseHandle(self.0) };
        }
    }

    struct EnvBlock(*mut c_void);
    impl Drop for EnvBlock {
        fn drop(&mut self) {
            #[link(name = "userenv")]
            extern "system" {
                fn DestroyEnvironmentBlock(environment: *mut c_void) -> i32;
            }
            unsafe { DestroyEnvironmentBlock(self.0) };
        }
    }

    const MAXIMUM_ALLOWED: u32 = 0x0200_0000;
    const SECURITY_IDENTIFICATION: u32 = 1;
    const TOKEN_PRIMARY: u32 = 1;
    const CREATE_UNICODE_ENVIRONMENT: u32 = 0x0000_0400;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let exe = std::env::current_exe()?;
    let command = format!(
        "\"{}\" --capture-helper {} {}",
        exe.display(),
        capture_pipe,
        input_pipe
    );

    let mut user_token: Handle = std::ptr::null_mut();
    if unsafe { WTSQueryUserToken(session_id, &mut user_token) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let user_token = OwnedHandle(user_token);

    let mut primary: Handle = std::ptr::null_mut();
    if unsafe {
        DuplicateTokenEx(
            user_token.0,
            MAXIMUM_ALLOWED,
            std::ptr::null_mut(),
            SECURITY_IDENTIFICATION,
            TOKEN_PRIMARY,
            &mut primary,
        )
    } == 0
    {
        return Err(std::io::Error::last_os_error());
    }
    let primary = OwnedHandle(primary);

    let mut environment: *mut c_void = std::ptr::null_mut();
    if unsafe { CreateEnvironmentBlock(&mut environment, primary.0, 0) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let environment = EnvBlock(environment);

    let mut desktop: Vec<u16> = std::ffi::OsStr::new("winsta0\\default")
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let mut command_line: Vec<u16> = std::ffi::OsStr::new(&command)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let mut startup: StartupInfoW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<StartupInfoW>() as u32;
    startup.desktop = desktop.as_mut_ptr();
    let mut process_info: ProcessInformation = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessAsUserW(
            primary.0,
            std::ptr::null(),
            command_line.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
            environment.0,
            std::ptr::null(),
            &startup,
            &mut process_info,
        )
    };
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let _process = OwnedHandle(process_info.process);
    let _thread = OwnedHandle(process_info.thread);

    tracing::info!(
        session_id,
        pid = process_info.process_id,
        "capture helper spawned"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn os_description_mentions_the_arch() {
        assert!(os_description().contains(std::env::consts::ARCH));
    }

    #[test]
    fn data_dir_ends_with_product_name() {
        assert!(data_dir().ends_with("hostlink"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cpu_counters_are_available_on_linux() {
        let times = cpu_times().expect("cpu counters");
        assert!(times.total >= times.idle);
    }
}
