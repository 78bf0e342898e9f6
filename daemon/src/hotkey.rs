/// Self-test hotkey and first-input detection using low-level Windows hooks
/// (`WH_KEYBOARD_LL`, `WH_MOUSE_LL`).
///
/// The hooks run on a dedicated OS thread with its own Windows message pump.
/// Pressing the configured combination sends [`DaemonEvent::SelfTestRequested`];
/// the first key or pointer press after start sends
/// [`DaemonEvent::UnlockGesture`] exactly once.  The hook thread exits cleanly
/// when [`HotkeyHandle::stop`] is called.
///
/// On non-Windows platforms the public API compiles but is a no-op at runtime.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

/// Currently watched combination, packed by [`Hotkey::pack`] (0 = disabled).
/// Written by [`HotkeyHandle::update_key`]; read inside the hook callback.
static HOOK_COMBO: AtomicU32 = AtomicU32::new(0);

/// Set once the unlock gesture has been reported.
static UNLOCK_SENT: AtomicBool = AtomicBool::new(false);

/// Tokio channel used to forward events from the hook callbacks to the main
/// event loop.  Set once by [`start`].
static HOOK_TX: OnceLock<mpsc::Sender<DaemonEvent>> = OnceLock::new();

const CTRL_BIT: u32 = 1 << 8;
const ALT_BIT: u32 = 1 << 9;
const SHIFT_BIT: u32 = 1 << 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("hotkey is empty")]
    Empty,
    #[error("unknown modifier '{0}' (expected Ctrl, Alt or Shift)")]
    UnknownModifier(String),
    #[error("unknown key '{0}'")]
    UnknownKey(String),
}

/// A key plus the modifiers that must be held with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hotkey {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    /// Windows virtual-key code.
    pub vk: u32,
}

impl Hotkey {
    pub fn pack(self) -> u32 {
        let mut packed = self.vk & 0xFF;
        if self.ctrl {
            packed |= CTRL_BIT;
        }
        if self.alt {
            packed |= ALT_BIT;
        }
        if self.shift {
            packed |= SHIFT_BIT;
        }
        packed
    }

    pub fn unpack(packed: u32) -> Self {
        Self {
            ctrl: packed & CTRL_BIT != 0,
            alt: packed & ALT_BIT != 0,
            shift: packed & SHIFT_BIT != 0,
            vk: packed & 0xFF,
        }
    }

    /// Whether a key press with `pressed` modifiers triggers this hotkey.
    /// Modifiers that are not part of the hotkey are ignored.
    pub fn matches(self, pressed: Hotkey) -> bool {
        self.vk != 0
            && pressed.vk == self.vk
            && (!self.ctrl || pressed.ctrl)
            && (!self.alt || pressed.alt)
            && (!self.shift || pressed.shift)
    }
}

/// Converts a key name (e.g. `"F8"`, `"A"`) to a Windows virtual-key code.
///
/// Supported keys:
/// - Function keys `F1`–`F12` (case-insensitive).
/// - ASCII letters `A`–`Z` (normalised to their uppercase VK values, `0x41`–`0x5A`).
/// - ASCII digits `0`–`9` (VK values `0x30`–`0x39`).
///
/// Returns `None` for any unrecognised name.
pub fn parse_vk(name: &str) -> Option<u32> {
    let upper = name.to_uppercase();
    if let Some(n) = upper.strip_prefix('F').and_then(|n| n.parse::<u32>().ok()) {
        return (1..=12).contains(&n).then_some(0x6F + n);
    }
    let mut chars = upper.chars();
    match (chars.next(), chars.next()) {
        // 'A'=0x41…'Z'=0x5A; '0'=0x30…'9'=0x39, matching Windows VK codes.
        (Some(c), None) if c.is_ascii_alphanumeric() => Some(c as u32),
        _ => None,
    }
}

/// Parses a combination such as `"Alt+Shift+B"`.  The key comes last;
/// modifier names are case-insensitive.
pub fn parse_hotkey(combo: &str) -> Result<Hotkey, HotkeyError> {
    let parts: Vec<&str> = combo.split('+').map(str::trim).collect();
    let Some((key, modifiers)) = parts.split_last() else {
        return Err(HotkeyError::Empty);
    };
    if key.is_empty() {
        return Err(HotkeyError::Empty);
    }

    let mut hotkey = Hotkey {
        vk: parse_vk(key).ok_or_else(|| HotkeyError::UnknownKey(key.to_string()))?,
        ..Hotkey::default()
    };
    for m in modifiers {
        match m.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => hotkey.ctrl = true,
            "alt" => hotkey.alt = true,
            "shift" => hotkey.shift = true,
            _ => return Err(HotkeyError::UnknownModifier(m.to_string())),
        }
    }
    Ok(hotkey)
}

/// Reports the first input gesture once per process.
fn take_unlock(flag: &AtomicBool) -> bool {
    !flag.swap(true, Ordering::SeqCst)
}

fn send(event: DaemonEvent) {
    if let Some(tx) = HOOK_TX.get() {
        // try_send is non-blocking; a full channel silently drops this event.
        let _ = tx.try_send(event);
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn on_key_down(pressed: Hotkey) {
    if take_unlock(&UNLOCK_SENT) {
        send(DaemonEvent::UnlockGesture);
    }
    if Hotkey::unpack(HOOK_COMBO.load(Ordering::Relaxed)).matches(pressed) {
        send(DaemonEvent::SelfTestRequested);
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn on_pointer_down() {
    if take_unlock(&UNLOCK_SENT) {
        send(DaemonEvent::UnlockGesture);
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A handle to the running hooks.
///
/// Allows updating the key binding on config reload and stopping the hook
/// thread when the daemon exits.
pub struct HotkeyHandle {
    #[cfg(windows)]
    _thread: std::thread::JoinHandle<()>,
    /// Thread ID of the message-pump thread, used to post `WM_QUIT`.
    #[cfg(windows)]
    thread_id: u32,
}

impl HotkeyHandle {
    /// Changes the active combination.  An unparseable combination disables
    /// the hotkey without stopping the hook thread and is returned as an error.
    pub fn update_key(&self, hotkey: &str) -> Result<(), HotkeyError> {
        match parse_hotkey(hotkey) {
            Ok(h) => {
                HOOK_COMBO.store(h.pack(), Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                HOOK_COMBO.store(0, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Signals the hook thread to stop and blocks until it exits.
    pub fn stop(self) {
        #[cfg(windows)]
        {
            imp::post_quit(self.thread_id);
            let _ = self._thread.join();
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Installs the hooks on a dedicated OS thread and returns a
/// [`HotkeyHandle`] for managing them.
///
/// # Non-Windows
/// Returns a stub handle; all methods compile and run but do nothing.
pub fn start(initial_hotkey: &str, tx: mpsc::Sender<DaemonEvent>) -> anyhow::Result<HotkeyHandle> {
    // Silently ignore if called more than once (e.g. in test binaries).
    let _ = HOOK_TX.set(tx);

    #[cfg(windows)]
    let handle = {
        use anyhow::Context;

        let (id_tx, id_rx) = std::sync::mpsc::sync_channel::<u32>(1);
        let thread = std::thread::Builder::new()
            .name("hotkey-pump".into())
            .spawn(move || imp::run_message_pump(id_tx))
            .context("Failed to spawn hotkey thread")?;
        let thread_id = id_rx.recv().context("Hotkey thread did not send its ID")?;
        HotkeyHandle { _thread: thread, thread_id }
    };

    #[cfg(not(windows))]
    let handle = HotkeyHandle {};

    if let Err(e) = handle.update_key(initial_hotkey) {
        tracing::warn!(error = %e, hotkey = initial_hotkey, "self-test hotkey disabled");
    }
    Ok(handle)
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::mpsc as std_mpsc;

    use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::Input::KeyboardAndMouse::{GetAsyncKeyState, VK_CONTROL, VK_SHIFT};
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetMessageW, PostThreadMessageW, SetWindowsHookExW,
        UnhookWindowsHookEx, KBDLLHOOKSTRUCT, LLKHF_ALTDOWN, MSG, WH_KEYBOARD_LL, WH_MOUSE_LL,
        WM_KEYDOWN, WM_LBUTTONDOWN, WM_MBUTTONDOWN, WM_QUIT, WM_RBUTTONDOWN, WM_SYSKEYDOWN,
    };

    use super::Hotkey;

    fn is_down(vk: u16) -> bool {
        // High bit set = key currently down.
        unsafe { GetAsyncKeyState(vk as i32) < 0 }
    }

    /// Low-level keyboard hook procedure.
    ///
    /// Alt combinations arrive as `WM_SYSKEYDOWN`, so both key-down messages
    /// are handled.
    unsafe extern "system" fn keyboard_proc(
        n_code: i32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        let msg = w_param.0 as u32;
        if n_code >= 0 && (msg == WM_KEYDOWN || msg == WM_SYSKEYDOWN) {
            let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
            super::on_key_down(Hotkey {
                ctrl: is_down(VK_CONTROL.0),
                alt: kb.flags.0 & LLKHF_ALTDOWN.0 != 0,
                shift: is_down(VK_SHIFT.0),
                vk: kb.vkCode,
            });
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Low-level mouse hook procedure; only button presses count as input.
    unsafe extern "system" fn mouse_proc(
        n_code: i32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        let msg = w_param.0 as u32;
        if n_code >= 0 && matches!(msg, WM_LBUTTONDOWN | WM_RBUTTONDOWN | WM_MBUTTONDOWN) {
            super::on_pointer_down();
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Installs both hooks, runs a Windows message pump until `WM_QUIT`,
    /// then uninstalls them.
    ///
    /// Sends the current thread ID to `id_tx` before entering the pump so
    /// that [`super::start`] can later use it to post `WM_QUIT`.
    pub fn run_message_pump(id_tx: std_mpsc::SyncSender<u32>) {
        unsafe {
            let _ = id_tx.send(GetCurrentThreadId());
            drop(id_tx);

            let keyboard = match SetWindowsHookExW(
                WH_KEYBOARD_LL,
                Some(keyboard_proc),
                HINSTANCE::default(),
                0,
            ) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "keyboard hook unavailable");
                    return;
                }
            };
            let mouse =
                SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_proc), HINSTANCE::default(), 0).ok();

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                DispatchMessageW(&msg);
            }

            let _ = UnhookWindowsHookEx(keyboard);
            if let Some(mouse) = mouse {
                let _ = UnhookWindowsHookEx(mouse);
            }
            tracing::debug!("hook thread exited");
        }
    }

    /// Posts `WM_QUIT` to `thread_id`, causing its `GetMessageW` loop to exit.
    pub fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
