/// Diagnostic console task.
///
/// Line-oriented: bytes accumulate until CR or LF, the line runs against
/// the shared register file, and the OK/ERR response is written back.
/// Commands take effect through the same mailbox as the bus server.

use embassy_stm32::mode::Async;
use embassy_stm32::usart::Uart;
use heapless::String;

use super::{COMMAND_MAILBOX, REGISTERS};
use crate::firmware::comms::cli::process_line;

const MAX_LINE: usize = 128;

#[embassy_executor::task]
pub async fn console(mut uart: Uart<'static, Async>) -> ! {
    defmt::info!("console ready");
    let mut line: String<MAX_LINE> = String::new();

    loop {
        let mut byte = [0u8; 1];
        if uart.read(&mut byte).await.is_err() {
            line.clear();
            continue;
        }
        match byte[0] {
            b'\r' | b'\n' => {
                if line.is_empty() {
                    continue;
                }
                let response = {
                    let mut guard = REGISTERS.lock().await;
                    match guard.as_mut() {
                        Some(registers) => {
                            let response = process_line(line.as_str(), registers);
                            while let Some(command) = registers.take_pending() {
                                COMMAND_MAILBOX.post(command);
                            }
                            response
                        }
                        None => {
                            line.clear();
                            continue;
                        }
                    }
                };
                line.clear();
                let _ = uart.write(response.as_bytes()).await;
            }
            // Anything that does not fit is discarded along with the rest
            // of the line; the parser reports the error on dispatch.
            b => {
                let _ = line.push(b as char);
            }
        }
    }
}
