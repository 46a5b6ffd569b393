#![no_std]
#![no_main]

mod firmware;

use defmt_rtt as _;
use panic_probe as _;

use embassy_executor::Spawner;

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    firmware::startup::run(spawner).await
}
