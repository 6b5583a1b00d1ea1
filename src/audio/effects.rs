use serde::{Deserialize, Serialize};
use tracing::info;

/// Descriptor de un efecto de audio aplicable a un entry
///
/// La cadena de efectos viaja con el entry hasta el sink, que es quien la
/// traduce a su pipeline real de audio. Se serializa junto con la cola.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectDescriptor {
    /// Cambia la velocidad de reproducción sin tocar el tono
    Speed { factor: f32 },
    /// Desplaza el tono en semitonos
    Pitch { semitones: f32 },
    /// Refuerzo de graves en decibelios
    BassBoost { gain_db: f32 },
    /// Atenúa la voz central (modo karaoke)
    Karaoke,
    /// Filtro arbitrario que el sink interpreta tal cual
    Custom { filter: String },
}

impl EffectDescriptor {
    /// Nombre corto del efecto para logs y estado
    pub fn name(&self) -> &'static str {
        match self {
            EffectDescriptor::Speed { .. } => "speed",
            EffectDescriptor::Pitch { .. } => "pitch",
            EffectDescriptor::BassBoost { .. } => "bass_boost",
            EffectDescriptor::Karaoke => "karaoke",
            EffectDescriptor::Custom { .. } => "custom",
        }
    }
}

/// Describe una cadena de efectos de forma legible
pub fn describe_chain(chain: &[EffectDescriptor]) -> String {
    if chain.is_empty() {
        return "sin efectos".to_string();
    }
    chain
        .iter()
        .map(EffectDescriptor::name)
        .collect::<Vec<_>>()
        .join(" + ")
}

/// Combina los efectos pendientes del player con los propios del entry
///
/// Los pendientes van primero y no se duplican efectos del mismo nombre.
pub fn merge_pending(pending: Vec<EffectDescriptor>, own: &[EffectDescriptor]) -> Vec<EffectDescriptor> {
    let mut merged = pending;
    for effect in own {
        if !merged.iter().any(|e| e.name() == effect.name()) {
            merged.push(effect.clone());
        }
    }
    if !merged.is_empty() {
        info!("🎛️ Cadena de efectos aplicada: {}", describe_chain(&merged));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_pending_keeps_order_and_dedupes() {
        let pending = vec![EffectDescriptor::Karaoke, EffectDescriptor::Speed { factor: 1.25 }];
        let own = vec![
            EffectDescriptor::Speed { factor: 0.75 },
            EffectDescriptor::BassBoost { gain_db: 4.0 },
        ];

        let merged = merge_pending(pending, &own);

        assert_eq!(
            merged,
            vec![
                EffectDescriptor::Karaoke,
                EffectDescriptor::Speed { factor: 1.25 },
                EffectDescriptor::BassBoost { gain_db: 4.0 },
            ]
        );
    }

    #[test]
    fn test_describe_chain() {
        assert_eq!(describe_chain(&[]), "sin efectos");
        assert_eq!(
            describe_chain(&[EffectDescriptor::Karaoke, EffectDescriptor::Pitch { semitones: 2.0 }]),
            "karaoke + pitch"
        );
    }
}
