//! Line discipline for the debug console: buffers keystrokes into a line and
//! dispatches completed lines to `shell::exec_command`.

use alloc::string::String;

use crate::drivers::keyboard;
use crate::drivers::keyboard::scancodes::KeyCode;
use crate::{print, println};

pub fn init() {
    crate::log_info!("Virtual TTY System initialized.");
    print_prompt();
}

pub fn print_prompt() {
    print!("root@atomicos:~$ ");
}

pub fn process_input_loop() -> ! {
    let mut line = String::new();
    loop {
        match keyboard::read_char() {
            KeyCode::Char(c) => {
                line.push(c);
                print!("{}", c);
            }
            KeyCode::Space => {
                line.push(' ');
                print!(" ");
            }
            KeyCode::Enter => {
                println!();
                crate::shell::exec_command(&line);
                line.clear();
                print_prompt();
            }
            KeyCode::Backspace => {
                if line.pop().is_some() {
                    crate::vga::WRITER.lock().backspace();
                }
            }
            KeyCode::ArrowUp
            | KeyCode::ArrowDown
            | KeyCode::ArrowLeft
            | KeyCode::ArrowRight
            | KeyCode::F(_)
            | KeyCode::Unknown => {}
        }
    }
}
