use bitcoin::{
    CompressedPublicKey, PublicKey, Script, ScriptBuf, TxIn, Witness,
    script::Instruction,
};

/// Derive the script an input spends from its scriptSig and witness.
///
/// Recognised: P2PKH, P2SH (including nested segwit), P2WPKH and P2WSH. Returns `None` for
/// anything else (P2PK, taproot, non-push scriptSigs), such inputs carry no balance.
pub fn spending_script(input: &TxIn) -> Option<ScriptBuf> {
    let pushes = push_only(&input.script_sig)?;

    if !input.witness.is_empty() {
        return match pushes.as_slice() {
            [] => native_segwit(&input.witness),
            // nested segwit, the single push is the witness program
            [program] if Script::from_bytes(program).is_witness_program() => {
                Some(ScriptBuf::new_p2sh(&Script::from_bytes(program).script_hash()))
            }
            _ => None,
        };
    }

    match pushes.as_slice() {
        [sig, pubkey] if is_signature(sig) && is_public_key(pubkey) => {
            let pubkey = PublicKey::from_slice(pubkey).ok()?;
            Some(ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()))
        }
        // P2PK
        [sig] if is_signature(sig) => None,
        [.., redeem] if !redeem.is_empty() && is_parsable(redeem) => {
            Some(ScriptBuf::new_p2sh(&Script::from_bytes(redeem).script_hash()))
        }
        _ => None,
    }
}

fn native_segwit(witness: &Witness) -> Option<ScriptBuf> {
    let items = witness.iter().collect::<Vec<_>>();

    match items.as_slice() {
        [sig, pubkey] if is_signature(sig) && pubkey.len() == 33 => {
            let pubkey = CompressedPublicKey::from_slice(pubkey).ok()?;
            Some(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()))
        }
        // taproot key path
        [sig] if sig.len() == 64 || sig.len() == 65 => None,
        [.., last] if is_taproot_script_path(&items, last) => None,
        [.., witness_script] => {
            Some(ScriptBuf::new_p2wsh(&Script::from_bytes(witness_script).wscript_hash()))
        }
        [] => None,
    }
}

/// Annex (0x50 prefixed last item) or control block as the last item
fn is_taproot_script_path(items: &[&[u8]], last: &[u8]) -> bool {
    if items.len() < 2 {
        return false;
    }

    let annex = last.first() == Some(&0x50);
    let control_block =
        last.len() >= 33 && (last.len() - 33) % 32 == 0 && last[0] & 0xfe == 0xc0;

    annex || control_block
}

fn push_only(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

/// DER signature followed by a sighash byte
fn is_signature(bytes: &[u8]) -> bool {
    (9..=73).contains(&bytes.len()) && bytes[0] == 0x30 && bytes[1] as usize == bytes.len() - 3
}

fn is_public_key(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(0x02 | 0x03) => bytes.len() == 33,
        Some(0x04) => bytes.len() == 65,
        _ => false,
    }
}

fn is_parsable(bytes: &[u8]) -> bool {
    Script::from_bytes(bytes).instructions().all(|i| i.is_ok())
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        OutPoint, Sequence,
        hashes::Hash,
        script::{Builder, PushBytesBuf},
    };

    use super::*;

    // generator point, a valid compressed key
    const PUBKEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn signature() -> Vec<u8> {
        let mut sig = vec![0x30, 68];
        sig.extend([0x02; 68]);
        sig.push(0x01);
        sig
    }

    fn input(script_sig: ScriptBuf, witness: Vec<Vec<u8>>) -> TxIn {
        TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::from_slice(&witness),
        }
    }

    fn push(bytes: &[u8]) -> PushBytesBuf {
        PushBytesBuf::try_from(bytes.to_vec()).unwrap()
    }

    #[test]
    fn p2pkh_spends_resolve_to_the_key_hash() {
        let pubkey = hex::decode(PUBKEY).unwrap();
        let script_sig = Builder::new()
            .push_slice(push(&signature()))
            .push_slice(push(&pubkey))
            .into_script();

        let expected = ScriptBuf::new_p2pkh(&PublicKey::from_slice(&pubkey).unwrap().pubkey_hash());

        assert_eq!(spending_script(&input(script_sig, vec![])), Some(expected));
    }

    #[test]
    fn p2wpkh_spends_resolve_from_the_witness() {
        let pubkey = hex::decode(PUBKEY).unwrap();

        let expected = ScriptBuf::new_p2wpkh(
            &CompressedPublicKey::from_slice(&pubkey).unwrap().wpubkey_hash(),
        );

        assert_eq!(
            spending_script(&input(ScriptBuf::new(), vec![signature(), pubkey])),
            Some(expected)
        );
    }

    #[test]
    fn p2sh_multisig_spends_resolve_to_the_redeem_hash() {
        let redeem = Builder::new()
            .push_int(1)
            .push_slice(push(&hex::decode(PUBKEY).unwrap()))
            .push_int(1)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();

        let script_sig = Builder::new()
            .push_int(0)
            .push_slice(push(&signature()))
            .push_slice(push(redeem.as_bytes()))
            .into_script();

        assert_eq!(
            spending_script(&input(script_sig, vec![])),
            Some(ScriptBuf::new_p2sh(&redeem.script_hash()))
        );
    }

    #[test]
    fn nested_segwit_resolves_to_the_outer_p2sh() {
        let program = ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::all_zeros());
        let script_sig = Builder::new().push_slice(push(program.as_bytes())).into_script();

        assert_eq!(
            spending_script(&input(script_sig, vec![vec![1], vec![0x51]])),
            Some(ScriptBuf::new_p2sh(&program.script_hash()))
        );
    }

    #[test]
    fn p2wsh_resolves_to_the_witness_script() {
        let witness_script = vec![0x51];

        assert_eq!(
            spending_script(&input(ScriptBuf::new(), vec![vec![], witness_script.clone()])),
            Some(ScriptBuf::new_p2wsh(
                &Script::from_bytes(&witness_script).wscript_hash()
            ))
        );
    }

    #[test]
    fn unrecognised_spends_are_ignored() {
        // P2PK
        let p2pk = Builder::new().push_slice(push(&signature())).into_script();
        assert_eq!(spending_script(&input(p2pk, vec![])), None);

        // taproot key path
        assert_eq!(spending_script(&input(ScriptBuf::new(), vec![vec![7; 64]])), None);

        // non-push scriptSig
        let non_push = Builder::new()
            .push_opcode(bitcoin::opcodes::all::OP_DUP)
            .into_script();
        assert_eq!(spending_script(&input(non_push, vec![])), None);

        // coinbase-like empty input
        assert_eq!(spending_script(&input(ScriptBuf::new(), vec![])), None);
    }
}
