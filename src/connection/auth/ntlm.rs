//! NTLM authentication.
//!
//! Implements the client side of the NTLMv2 handshake with extended session
//! security and key exchange, plus the sign/seal session used to encrypt
//! WinRM message bodies over plain HTTP.

use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, Zeroizing};

use super::{
    AuthMethod, AuthStep, AuthStrategy, Credentials, SealedMessage, SecurityContext,
    SPNEGO_ENCRYPTED_PROTOCOL,
};
use crate::connection::endpoint::Endpoint;
use crate::error::{WinRmError, WinRmResult};

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NTLMSSP_NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NTLMSSP_REQUEST_TARGET: u32 = 0x0000_0004;
const NTLMSSP_NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NTLMSSP_NEGOTIATE_SEAL: u32 = 0x0000_0020;
const NTLMSSP_NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NTLMSSP_NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NTLMSSP_NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NTLMSSP_NEGOTIATE_128: u32 = 0x2000_0000;
const NTLMSSP_NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
const NTLMSSP_NEGOTIATE_56: u32 = 0x8000_0000;

/// Flags offered in the negotiate message.
const CLIENT_FLAGS: u32 = NTLMSSP_NEGOTIATE_UNICODE
    | NTLMSSP_REQUEST_TARGET
    | NTLMSSP_NEGOTIATE_SIGN
    | NTLMSSP_NEGOTIATE_SEAL
    | NTLMSSP_NEGOTIATE_NTLM
    | NTLMSSP_NEGOTIATE_ALWAYS_SIGN
    | NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NTLMSSP_NEGOTIATE_TARGET_INFO
    | NTLMSSP_NEGOTIATE_128
    | NTLMSSP_NEGOTIATE_KEY_EXCH
    | NTLMSSP_NEGOTIATE_56;

/// AV pair ids
const MSV_AV_EOL: u16 = 0x0000;
const MSV_AV_TIMESTAMP: u16 = 0x0007;

/// Fixed part of the authenticate message (no version, no MIC).
const AUTHENTICATE_HEADER_LEN: usize = 64;

const CLIENT_SIGNING: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING: &[u8] = b"session key to server-to-client sealing key magic constant\0";

// ============================================================================
// Challenge message
// ============================================================================

/// Parsed NTLM Type 2 (Challenge) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    /// Flags the server agreed to
    pub flags: u32,
    /// Server challenge nonce
    pub server_challenge: [u8; 8],
    /// Raw AV pair list
    pub target_info: Vec<u8>,
}

impl ChallengeMessage {
    /// Parse a challenge message.
    pub fn parse(bytes: &[u8]) -> WinRmResult<Self> {
        if bytes.len() < 32 || &bytes[..8] != NTLMSSP_SIGNATURE {
            return Err(WinRmError::authentication("invalid NTLM challenge message"));
        }
        if read_u32(bytes, 8) != 2 {
            return Err(WinRmError::authentication(format!(
                "expected NTLM challenge (type 2), got type {}",
                read_u32(bytes, 8)
            )));
        }

        let flags = read_u32(bytes, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);

        let target_info = if bytes.len() >= 48 {
            let len = read_u16(bytes, 40) as usize;
            let offset = read_u32(bytes, 44) as usize;
            bytes
                .get(offset..offset + len)
                .ok_or_else(|| {
                    WinRmError::authentication("NTLM challenge target info is out of bounds")
                })?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Server timestamp from the `MsvAvTimestamp` AV pair, if present.
    pub fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut pos = 0;
        while pos + 4 <= info.len() {
            let id = read_u16(info, pos);
            let len = read_u16(info, pos + 2) as usize;
            if id == MSV_AV_EOL {
                break;
            }
            let value = info.get(pos + 4..pos + 4 + len)?;
            if id == MSV_AV_TIMESTAMP && len == 8 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(value);
                return Some(u64::from_le_bytes(raw));
            }
            pos += 4 + len;
        }
        None
    }
}

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NtlmState {
    Initial,
    NegotiateSent,
    Established,
}

/// Client-side NTLM security context.
pub struct NtlmContext {
    username: String,
    domain: String,
    password: SecretString,
    workstation: String,
    state: NtlmState,
    session: Option<SessionSecurity>,
}

impl NtlmContext {
    /// Create a context for `credentials`.
    pub fn new(credentials: &Credentials) -> Self {
        let (domain, user) = credentials.domain_and_user();
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().to_uppercase())
            .unwrap_or_else(|_| "WORKSTATION".to_string());

        Self {
            username: user.to_string(),
            domain: domain.unwrap_or_default().to_string(),
            password: SecretString::new(
                credentials.password().expose_secret().to_owned().into_boxed_str(),
            ),
            workstation,
            state: NtlmState::Initial,
            session: None,
        }
    }

    /// Override the workstation name reported to the server.
    pub fn with_workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = workstation.into();
        self
    }

    /// Build the Type 1 (Negotiate) message.
    pub fn negotiate_message(&self) -> Vec<u8> {
        let mut message = NTLMSSP_SIGNATURE.to_vec();
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        // Empty domain and workstation buffers
        push_security_buffer(&mut message, 0, 32);
        push_security_buffer(&mut message, 0, 32);
        message
    }

    /// Build the Type 3 (Authenticate) message for `challenge` and derive the
    /// session keys.
    pub fn authenticate_message(&mut self, challenge: &ChallengeMessage) -> WinRmResult<Vec<u8>> {
        let client_challenge: [u8; 8] = rand::random();
        let exported_session_key: [u8; 16] = rand::random();
        let (message, session) =
            self.build_authenticate(challenge, client_challenge, exported_session_key)?;
        self.session = Some(session);
        Ok(message)
    }

    fn build_authenticate(
        &self,
        challenge: &ChallengeMessage,
        client_challenge: [u8; 8],
        exported_session_key: [u8; 16],
    ) -> WinRmResult<(Vec<u8>, SessionSecurity)> {
        let flags = challenge.flags & CLIENT_FLAGS;
        if flags & NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY == 0 {
            return Err(WinRmError::authentication(
                "server did not negotiate NTLMv2 extended session security",
            ));
        }
        if flags & NTLMSSP_NEGOTIATE_SEAL != 0 && flags & NTLMSSP_NEGOTIATE_128 == 0 {
            return Err(WinRmError::authentication(
                "server refused 128-bit NTLM session keys",
            ));
        }

        let response_key = response_key_nt(&self.username, &self.domain, &self.password);

        // With a server timestamp the LM response is omitted (zeroed).
        let (timestamp, lm_response) = match challenge.timestamp() {
            Some(ts) => (ts, vec![0u8; 24]),
            None => (
                windows_timestamp(),
                lmv2_response(&response_key, &challenge.server_challenge, &client_challenge),
            ),
        };

        let (nt_response, session_base_key) = ntlmv2_response(
            &response_key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp,
            &challenge.target_info,
        );

        let key_exch = flags & NTLMSSP_NEGOTIATE_KEY_EXCH != 0;
        let (exported, encrypted_session_key) = if key_exch {
            let encrypted = Rc4::new(&session_base_key[..]).apply(&exported_session_key);
            (Zeroizing::new(exported_session_key), encrypted)
        } else {
            (session_base_key, Vec::new())
        };

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let mut offset = AUTHENTICATE_HEADER_LEN;
        let mut message = NTLMSSP_SIGNATURE.to_vec();
        message.extend_from_slice(&3u32.to_le_bytes());

        let payload_order: [&[u8]; 6] = [
            &domain,
            &user,
            &workstation,
            &lm_response,
            &nt_response,
            &encrypted_session_key,
        ];
        let mut offsets = [0usize; 6];
        for (slot, field) in offsets.iter_mut().zip(payload_order.iter()) {
            *slot = offset;
            offset += field.len();
        }

        // Header buffers are LM, NT, domain, user, workstation, session key
        push_security_buffer(&mut message, lm_response.len(), offsets[3]);
        push_security_buffer(&mut message, nt_response.len(), offsets[4]);
        push_security_buffer(&mut message, domain.len(), offsets[0]);
        push_security_buffer(&mut message, user.len(), offsets[1]);
        push_security_buffer(&mut message, workstation.len(), offsets[2]);
        push_security_buffer(&mut message, encrypted_session_key.len(), offsets[5]);
        message.extend_from_slice(&flags.to_le_bytes());

        for field in payload_order {
            message.extend_from_slice(field);
        }

        let session = SessionSecurity::new(&exported, Role::Client, key_exch);
        Ok((message, session))
    }
}

impl SecurityContext for NtlmContext {
    fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep> {
        match (self.state, server_token) {
            (NtlmState::Initial, None) => {
                self.state = NtlmState::NegotiateSent;
                Ok(AuthStep::Continue(self.negotiate_message()))
            }
            (NtlmState::NegotiateSent, Some(token)) => {
                let challenge = ChallengeMessage::parse(token)?;
                let message = self.authenticate_message(&challenge)?;
                self.state = NtlmState::Established;
                Ok(AuthStep::Continue(message))
            }
            (NtlmState::Established, _) => Ok(AuthStep::Complete),
            (NtlmState::NegotiateSent, None) => Err(WinRmError::authentication(
                "server did not answer the NTLM negotiate message with a challenge",
            )),
            (NtlmState::Initial, Some(_)) => Err(WinRmError::authentication(
                "received an NTLM token before negotiating",
            )),
        }
    }

    fn is_established(&self) -> bool {
        self.state == NtlmState::Established
    }

    fn wrap(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage> {
        Ok(self.session_mut()?.seal(plaintext))
    }

    fn unwrap(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        self.session_mut()?.unseal(message)
    }
}

impl NtlmContext {
    fn session_mut(&mut self) -> WinRmResult<&mut SessionSecurity> {
        self.session.as_mut().ok_or_else(|| {
            WinRmError::Unexpected("NTLM session keys are not established".to_string())
        })
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// NTLM strategy, carried in the HTTP `Negotiate` scheme.
pub struct NtlmAuth {
    context: NtlmContext,
}

impl NtlmAuth {
    /// Create the strategy for `credentials`.
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            context: NtlmContext::new(credentials),
        }
    }
}

impl AuthStrategy for NtlmAuth {
    fn method(&self) -> AuthMethod {
        AuthMethod::Ntlm
    }

    fn check_endpoint(&self, _endpoint: &Endpoint) -> WinRmResult<()> {
        Ok(())
    }

    fn header_scheme(&self) -> &'static str {
        "Negotiate"
    }

    fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep> {
        self.context.step(server_token)
    }

    fn is_established(&self) -> bool {
        self.context.is_established()
    }

    fn encryption_protocol(&self) -> Option<&'static str> {
        Some(SPNEGO_ENCRYPTED_PROTOCOL)
    }

    fn seal(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage> {
        self.context.wrap(plaintext)
    }

    fn unseal(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        self.context.unwrap(message)
    }
}

// ============================================================================
// Session security
// ============================================================================

/// Which side of the session a [`SessionSecurity`] plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side: seals with client-to-server keys
    Client,
    /// Server side: seals with server-to-client keys
    Server,
}

/// NTLMv2 sign/seal state for one direction pair.
pub struct SessionSecurity {
    sign_out: Zeroizing<[u8; 16]>,
    sign_in: Zeroizing<[u8; 16]>,
    seal_out: Rc4,
    seal_in: Rc4,
    seq_out: u32,
    seq_in: u32,
    key_exch: bool,
}

impl SessionSecurity {
    /// Derive signing and sealing keys from the exported session key.
    pub fn new(exported_session_key: &[u8; 16], role: Role, key_exch: bool) -> Self {
        let client_sign = derive_key(exported_session_key, CLIENT_SIGNING);
        let server_sign = derive_key(exported_session_key, SERVER_SIGNING);
        let client_seal = derive_key(exported_session_key, CLIENT_SEALING);
        let server_seal = derive_key(exported_session_key, SERVER_SEALING);

        let (sign_out, sign_in, seal_out, seal_in) = match role {
            Role::Client => (client_sign, server_sign, client_seal, server_seal),
            Role::Server => (server_sign, client_sign, server_seal, client_seal),
        };

        Self {
            sign_out,
            sign_in,
            seal_out: Rc4::new(&seal_out[..]),
            seal_in: Rc4::new(&seal_in[..]),
            seq_out: 0,
            seq_in: 0,
            key_exch,
        }
    }

    /// Encrypt `message` and compute its signature.
    pub fn seal(&mut self, message: &[u8]) -> SealedMessage {
        let payload = self.seal_out.apply(message);
        let signature = signature(
            &self.sign_out,
            &mut self.seal_out,
            self.key_exch,
            self.seq_out,
            message,
        );
        self.seq_out = self.seq_out.wrapping_add(1);
        SealedMessage {
            signature: signature.to_vec(),
            payload,
        }
    }

    /// Decrypt `message` and verify its signature.
    pub fn unseal(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        let plaintext = self.seal_in.apply(&message.payload);
        let expected = signature(
            &self.sign_in,
            &mut self.seal_in,
            self.key_exch,
            self.seq_in,
            &plaintext,
        );
        if message.signature.as_slice() != expected.as_slice() {
            return Err(WinRmError::authentication(
                "NTLM signature of the server response does not verify",
            ));
        }
        self.seq_in = self.seq_in.wrapping_add(1);
        Ok(plaintext)
    }
}

fn signature(
    sign_key: &[u8; 16],
    seal: &mut Rc4,
    key_exch: bool,
    seq: u32,
    message: &[u8],
) -> [u8; 16] {
    let mut data = seq.to_le_bytes().to_vec();
    data.extend_from_slice(message);
    let mac = hmac_md5(sign_key, &data);

    let checksum = if key_exch {
        seal.apply(&mac[..8])
    } else {
        mac[..8].to_vec()
    };

    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&1u32.to_le_bytes());
    out[4..12].copy_from_slice(&checksum);
    out[12..].copy_from_slice(&seq.to_le_bytes());
    out
}

fn derive_key(exported_session_key: &[u8; 16], magic: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut ctx = md5::Context::new();
    ctx.consume(exported_session_key);
    ctx.consume(magic);
    Zeroizing::new(ctx.compute().0)
}

// ============================================================================
// Primitives
// ============================================================================

/// RC4 keystream.
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .map(|byte| {
                self.i = self.i.wrapping_add(1);
                self.j = self.j.wrapping_add(self.state[self.i as usize]);
                self.state.swap(self.i as usize, self.j as usize);
                let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
                byte ^ self.state[idx as usize]
            })
            .collect()
    }
}

impl Drop for Rc4 {
    fn drop(&mut self) {
        self.state.zeroize();
    }
}

/// NT hash: MD4 of the UTF-16LE password.
fn nt_hash(password: &SecretString) -> Zeroizing<[u8; 16]> {
    use md4::{Digest, Md4};

    let password_unicode = Zeroizing::new(utf16le(password.expose_secret()));

    let mut hasher = Md4::new();
    hasher.update(&*password_unicode);
    let result = hasher.finalize();

    let mut hash = [0u8; 16];
    hash.copy_from_slice(&result);
    Zeroizing::new(hash)
}

/// NTOWFv2: HMAC-MD5(NT hash, UTF-16LE(uppercase(user) + domain)).
fn response_key_nt(user: &str, domain: &str, password: &SecretString) -> Zeroizing<[u8; 16]> {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    Zeroizing::new(hmac_md5(&nt_hash(password)[..], &identity))
}

/// NTLMv2 response and session base key.
fn ntlmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> (Vec<u8>, Zeroizing<[u8; 16]>) {
    let mut temp = vec![1u8, 1, 0, 0, 0, 0, 0, 0];
    temp.extend_from_slice(&timestamp.to_le_bytes());
    temp.extend_from_slice(client_challenge);
    temp.extend_from_slice(&[0u8; 4]);
    temp.extend_from_slice(target_info);
    temp.extend_from_slice(&[0u8; 4]);

    let mut data = server_challenge.to_vec();
    data.extend_from_slice(&temp);
    let nt_proof_str = hmac_md5(response_key, &data);
    let session_base_key = Zeroizing::new(hmac_md5(response_key, &nt_proof_str));

    let mut response = nt_proof_str.to_vec();
    response.extend_from_slice(&temp);
    (response, session_base_key)
}

/// LMv2 response: HMAC-MD5(key, server + client challenge) + client challenge.
fn lmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Vec<u8> {
    let mut data = server_challenge.to_vec();
    data.extend_from_slice(client_challenge);
    let mut response = hmac_md5(response_key, &data).to_vec();
    response.extend_from_slice(client_challenge);
    response
}

/// HMAC-MD5 computation
fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut key_block = Zeroizing::new([0u8; 64]);
    if key.len() > 64 {
        let digest = md5::compute(key);
        key_block[..16].copy_from_slice(&digest.0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(64 + data.len());
    inner.extend(key_block.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(64 + 16);
    outer.extend(key_block.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_hash.0);
    let outer_hash = md5::compute(&outer);

    inner.zeroize();
    outer.zeroize();
    outer_hash.0
}

/// Current time as a Windows FILETIME (100ns ticks since 1601-01-01).
fn windows_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    const EPOCH_DIFF: u64 = 11_644_473_600;
    const TICKS_PER_SECOND: u64 = 10_000_000;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    (now.as_secs() + EPOCH_DIFF) * TICKS_PER_SECOND + u64::from(now.subsec_nanos() / 100)
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn push_security_buffer(message: &mut Vec<u8>, len: usize, offset: usize) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
