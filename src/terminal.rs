//! Terminal queries for choosing and sizing the progress display.

/// Whether to redraw progress in place: stdout is an interactive terminal
/// and TERM doesn't ask for plain output.
pub fn use_fancy() -> bool {
    if std::env::var_os("TERM").map_or(false, |term| term == "dumb") {
        return false;
    }
    imp::stdout_is_tty()
}

/// Terminal width in columns, if known and usable.
pub fn get_cols() -> Option<usize> {
    // Ignore too-narrow widths, they're usually a misreport.
    imp::cols().filter(|&cols| cols >= 10)
}

#[cfg(unix)]
mod imp {
    pub fn stdout_is_tty() -> bool {
        // Safety: isatty only inspects the descriptor.
        unsafe { libc::isatty(/* stdout */ 1) == 1 }
    }

    pub fn cols() -> Option<usize> {
        // Safety: TIOCGWINSZ fills in the zeroed struct we pass.
        unsafe {
            let mut winsize = std::mem::zeroed::<libc::winsize>();
            if libc::ioctl(1, libc::TIOCGWINSZ, &mut winsize) < 0 {
                return None;
            }
            Some(winsize.ws_col as usize)
        }
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::{Foundation::*, System::Console::*};

    pub fn stdout_is_tty() -> bool {
        // Safety: console queries on our own stdout handle.
        unsafe {
            let handle = GetStdHandle(STD_OUTPUT_HANDLE);
            let mut mode = 0;
            // GetConsoleMode itself fails when not attached to a console.
            let ok = GetConsoleMode(handle, &mut mode) != 0;
            if ok {
                // Enable terminal processing so we can overwrite previous
                // content.  Ignore errors.
                let _ = SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING);
            }
            ok
        }
    }

    pub fn cols() -> Option<usize> {
        // Safety: console queries on our own stdout handle.
        unsafe {
            let console = GetStdHandle(STD_OUTPUT_HANDLE);
            if console == INVALID_HANDLE_VALUE {
                return None;
            }
            let mut csbi = std::mem::zeroed::<CONSOLE_SCREEN_BUFFER_INFO>();
            if GetConsoleScreenBufferInfo(console, &mut csbi) == 0 {
                return None;
            }
            Some(csbi.dwSize.X as usize)
        }
    }
}
