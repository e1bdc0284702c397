pub mod dixon_coles;
pub mod elo;
pub mod ensemble;
