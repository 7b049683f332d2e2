//! 40-pin header layout (Raspberry Pi compatible)
//!
//! Static tables mapping physical header positions to BCM GPIO numbers and
//! naming the pins that belong to bus peripherals.

/// Physical header pin to BCM GPIO number
pub const PHYS_TO_BCM: [(u8, u8); 26] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

/// BCM pins owned by I2C, UART and SPI, with their bus function
pub const BUS_PINS: [(u8, &str); 9] = [
    (2, "I2C SDA"),
    (3, "I2C SCL"),
    (14, "UART TX"),
    (15, "UART RX"),
    (10, "SPI MOSI"),
    (9, "SPI MISO"),
    (11, "SPI SCLK"),
    (8, "SPI CE0"),
    (7, "SPI CE1"),
];

/// Header pins that carry power or ground
pub const POWER_PINS: [(u8, &str); 14] = [
    (1, "3V3"),
    (2, "5V"),
    (4, "5V"),
    (6, "GND"),
    (9, "GND"),
    (14, "GND"),
    (17, "3V3"),
    (20, "GND"),
    (25, "GND"),
    (27, "ID_SD"),
    (28, "ID_SC"),
    (30, "GND"),
    (34, "GND"),
    (39, "GND"),
];

/// BCM pins with a hardware PWM channel
pub const PWM_PINS: [u8; 4] = [12, 13, 18, 19];

/// Highest BCM number exposed on the header
pub const MAX_BCM: u8 = 27;

/// True if `bcm` is reserved for a bus protocol
pub fn is_bus_pin(bcm: u8) -> bool {
    BUS_PINS.iter().any(|(pin, _)| *pin == bcm)
}

/// True if `bcm` is a GPIO exposed on the header
pub fn is_gpio(bcm: u8) -> bool {
    PHYS_TO_BCM.iter().any(|(_, pin)| *pin == bcm)
}

/// Physical header position of a BCM pin
pub fn phys_for_bcm(bcm: u8) -> Option<u8> {
    PHYS_TO_BCM
        .iter()
        .find(|(_, pin)| *pin == bcm)
        .map(|(phys, _)| *phys)
}

/// BCM number at a physical header position
pub fn bcm_for_phys(phys: u8) -> Option<u8> {
    PHYS_TO_BCM
        .iter()
        .find(|(p, _)| *p == phys)
        .map(|(_, bcm)| *bcm)
}

/// Board function label shown in the pin table ("GPIO", "I2C SDA", ...)
pub fn function_label(bcm: u8) -> &'static str {
    BUS_PINS
        .iter()
        .find(|(pin, _)| *pin == bcm)
        .map(|(_, label)| *label)
        .unwrap_or("GPIO")
}

/// Capability hint for the info column
pub fn capability_hint(bcm: u8) -> String {
    format!("PWM:{}", if PWM_PINS.contains(&bcm) { 'Y' } else { 'N' })
}
