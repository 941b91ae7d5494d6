pub mod keygen;
pub mod sign;
pub mod verify;
