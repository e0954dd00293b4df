/*!
# IoClean DevKit - Équipements série simulés pour les tests

Bibliothèque facilitant les tests du bus de commandes sans matériel :
- MockSerial : un équipement au bout d'un tube mémoire
- LineBuilder : lignes SEN / CMD / ACK / CMO
- MockBus : plusieurs équipements, ouvertures comptées, pannes simulées
*/

pub mod mock_bus;
pub mod mock_serial;

pub use mock_bus::MockBus;
pub use mock_serial::{LineBuilder, MockSerial};
