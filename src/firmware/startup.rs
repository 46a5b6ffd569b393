use embassy_executor::Spawner;
use embassy_stm32::Config;

use crate::firmware::clocks;

pub async fn run(spawner: Spawner) -> ! {
    let mut config = Config::default();
    config.rcc = clocks::rcc_config();
    let p = embassy_stm32::init(config);

    clocks::log_clocks(&p.RCC);

    defmt::info!("=== BLDC servo controller ===");
    defmt::info!("target: STM32G474RE @ 170 MHz");

    crate::firmware::system::initialize(spawner, p).await
}
