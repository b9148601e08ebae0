pub mod intc;
pub mod uartlite;
