/*!
# Sillage DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement autour du kernel Sillage avec:
- Stub de canal push pour tests sans broker
- Générateurs de paquets traceurs (toutes les formes de protocole)
- Harness de test avec assertions sur les messages échangés
*/

pub mod packet_builders;
pub mod push_stub;
pub mod test_utils;

pub use packet_builders::PacketBuilder;
pub use push_stub::PushChannelStub;
pub use test_utils::TestHarness;
