/**
 * IOCLEAN KERNEL - Bus de commandes série
 *
 * Liens série par équipement, parser du protocole ligne, routage par
 * métrique, dispatcher avec corrélation des ACK, superviseur et API REST.
 */

pub mod config;
pub mod dispatcher;
pub mod facade;
pub mod frame;
pub mod health;
pub mod http;
pub mod link;
pub mod registry;
pub mod routing;
pub mod sink;
pub mod state;
pub mod supervisor;
