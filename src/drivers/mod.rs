pub mod keyboard;
pub mod tty;

pub fn init() {
    keyboard::init();
    tty::init();
    crate::log_info!("Drivers subsystem initialized.");
}
