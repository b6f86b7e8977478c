//! Provisioning console on a UART.

use bootstrapper_core::ByteStream;
use esp_idf_svc::hal::delay::NON_BLOCK;
use esp_idf_svc::hal::uart::UartDriver;
use log::warn;

pub struct UartConsole {
    uart: UartDriver<'static>,
}

impl UartConsole {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self { uart }
    }
}

impl ByteStream for UartConsole {
    fn try_read(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.uart.read(&mut byte, NON_BLOCK) {
            Ok(1) => Some(byte[0]),
            Ok(_) => None,
            Err(e) => {
                warn!("UART read failed: {}", e);
                None
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut sent = 0;
        while sent < bytes.len() {
            match self.uart.write(&bytes[sent..]) {
                Ok(n) => sent += n,
                Err(e) => {
                    warn!("UART write failed: {}", e);
                    return;
                }
            }
        }
    }
}
