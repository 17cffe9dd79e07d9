use std::io::{self, Write};

use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

/// Terminal in raw mode on the alternate screen. Restored on drop, so an
/// early return from the dashboard loop never leaves the shell broken.
pub struct Console<W: Write> {
    terminal: Terminal<CrosstermBackend<W>>,
    restored: bool,
}

impl Console<io::Stdout> {
    pub fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen, cursor::Hide) {
            let _ = terminal::disable_raw_mode();
            return Err(e);
        }

        match Terminal::new(CrosstermBackend::new(stdout)) {
            Ok(terminal) => Ok(Self::from_terminal(terminal)),
            Err(e) => {
                let _ = terminal::disable_raw_mode();
                let _ = execute!(io::stdout(), LeaveAlternateScreen, cursor::Show);
                Err(e)
            }
        }
    }
}

impl<W: Write> Console<W> {
    fn from_terminal(terminal: Terminal<CrosstermBackend<W>>) -> Self {
        Self {
            terminal,
            restored: false,
        }
    }

    pub fn terminal(&mut self) -> &mut Terminal<CrosstermBackend<W>> {
        &mut self.terminal
    }

    pub fn restore(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        terminal::disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;
        Ok(())
    }
}

impl<W: Write> Drop for Console<W> {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}
